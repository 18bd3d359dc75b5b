// LuaTable - array part + hash part, like the reference implementation.
// Integer keys from 1 up live in the dense array part; everything else in
// the hash part. Integral float keys are normalized to integers before
// either part is consulted.

use ahash::AHashMap;

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult};

pub struct LuaTable {
    array: Vec<LuaValue>,
    hash: AHashMap<LuaValue, LuaValue>,
    metatable: Option<LuaValue>,
}

impl LuaTable {
    pub fn new(array_size: usize, hash_size: usize) -> LuaTable {
        LuaTable {
            array: Vec::with_capacity(array_size),
            hash: AHashMap::with_capacity(hash_size),
            metatable: None,
        }
    }

    /// Normalize a key: integral floats become integers. Errors on nil and
    /// NaN keys; `raw_get` paths use [`LuaTable::normalize_read_key`]
    /// instead, which never errors.
    fn normalize_key(key: LuaValue) -> LuaResult<LuaValue> {
        match key {
            LuaValue::Nil => Err(LuaError::new("table index is nil")),
            LuaValue::Number(n) if n.is_nan() => Err(LuaError::new("table index is NaN")),
            other => Ok(Self::normalize_read_key(other)),
        }
    }

    fn normalize_read_key(key: LuaValue) -> LuaValue {
        if let LuaValue::Number(n) = key {
            if n.trunc() == n && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
                return LuaValue::Integer(n as i64);
            }
        }
        key
    }

    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        let key = Self::normalize_read_key(key.clone());
        if let LuaValue::Integer(i) = key {
            return self.raw_geti(i);
        }
        self.hash.get(&key).cloned().unwrap_or(LuaValue::Nil)
    }

    pub fn raw_geti(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[(i - 1) as usize].clone();
        }
        self.hash
            .get(&LuaValue::Integer(i))
            .cloned()
            .unwrap_or(LuaValue::Nil)
    }

    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let key = Self::normalize_key(key)?;
        if let LuaValue::Integer(i) = key {
            self.raw_seti(i, value);
            return Ok(());
        }
        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
        Ok(())
    }

    pub fn raw_seti(&mut self, i: i64, value: LuaValue) {
        if i >= 1 && (i as usize) <= self.array.len() {
            self.array[(i - 1) as usize] = value;
            return;
        }
        if i >= 1 && i as usize == self.array.len() + 1 && !value.is_nil() {
            self.array.push(value);
            self.migrate_from_hash();
            return;
        }
        if value.is_nil() {
            self.hash.remove(&LuaValue::Integer(i));
        } else {
            self.hash.insert(LuaValue::Integer(i), value);
        }
    }

    /// Pull integer keys that became contiguous with the array part out of
    /// the hash part.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = LuaValue::Integer(self.array.len() as i64 + 1);
            match self.hash.remove(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    /// Grow the array part to hold at least `n` slots (SETLIST pre-size).
    pub fn presize(&mut self, n: usize) {
        if n > self.array.len() {
            self.array.resize(n, LuaValue::Nil);
        }
    }

    /// A border of the table: the `#` operator.
    pub fn length(&self) -> i64 {
        let mut n = self.array.len();
        while n > 0 && self.array[n - 1].is_nil() {
            n -= 1;
        }
        if n == self.array.len() {
            // Dense part full; the border may extend into the hash part.
            let mut m = n as i64;
            while self.hash.contains_key(&LuaValue::Integer(m + 1)) {
                m += 1;
            }
            return m;
        }
        n as i64
    }

    /// Stateless iteration step for `next`: nil starts traversal, the
    /// returned key continues it. Errors when the key was never in the
    /// table.
    pub fn next(&self, key: &LuaValue) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let array_from = match key {
            LuaValue::Nil => Some(0),
            other => match Self::normalize_read_key(other.clone()) {
                LuaValue::Integer(i) if i >= 1 && (i as usize) <= self.array.len() => {
                    Some(i as usize)
                }
                _ => None,
            },
        };

        if let Some(from) = array_from {
            for idx in from..self.array.len() {
                if !self.array[idx].is_nil() {
                    return Ok(Some((
                        LuaValue::Integer(idx as i64 + 1),
                        self.array[idx].clone(),
                    )));
                }
            }
            return Ok(self.hash.iter().next().map(|(k, v)| (k.clone(), v.clone())));
        }

        let key = Self::normalize_read_key(key.clone());
        let mut it = self.hash.iter();
        while let Some((k, _)) = it.next() {
            if *k == key {
                return Ok(it.next().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Err(LuaError::new("invalid key to 'next'"))
    }

    pub fn metatable(&self) -> Option<LuaValue> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<LuaValue>) {
        self.metatable = mt;
    }

    /// Snapshot support: every live (key, value) pair, array part first.
    pub fn entries(&self) -> Vec<(LuaValue, LuaValue)> {
        let mut out = Vec::with_capacity(self.array.len() + self.hash.len());
        for (idx, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((LuaValue::Integer(idx as i64 + 1), v.clone()));
            }
        }
        for (k, v) in self.hash.iter() {
            out.push((k.clone(), v.clone()));
        }
        out
    }
}

impl std::fmt::Debug for LuaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaTable")
            .field("array_len", &self.array.len())
            .field("hash_len", &self.hash.len())
            .field("has_metatable", &self.metatable.is_some())
            .finish()
    }
}
