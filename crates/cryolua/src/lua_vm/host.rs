// Host callables: named functions the host binds into globals.
// Non-suspending callables return values synchronously; suspending ones
// may pause the cooperative runtime at their call boundary. Names are the
// snapshot identity - a restored graph rebinds host functions through the
// registry.

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::lua_value::Varargs;
use crate::lua_vm::{LuaResult, LuaVM, StackHandle};

pub enum HostReturn {
    Values(Varargs),
    /// Pause the cooperative runtime at this call boundary.
    Suspend,
}

/// What a host callable sees: the VM (sink, registry, globals), the live
/// execution chain, and its arguments.
pub struct HostScope<'a> {
    pub vm: &'a LuaVM,
    pub stack: StackHandle,
    pub args: Varargs,
}

pub type HostFnImpl = Box<dyn Fn(&mut HostScope) -> LuaResult<HostReturn>>;

pub struct HostFunction {
    name: SmolStr,
    suspendable: bool,
    f: HostFnImpl,
}

impl HostFunction {
    pub fn new(
        name: impl Into<SmolStr>,
        f: impl Fn(&mut HostScope) -> LuaResult<HostReturn> + 'static,
    ) -> HostFunction {
        HostFunction {
            name: name.into(),
            suspendable: false,
            f: Box::new(f),
        }
    }

    pub fn suspendable(
        name: impl Into<SmolStr>,
        f: impl Fn(&mut HostScope) -> LuaResult<HostReturn> + 'static,
    ) -> HostFunction {
        HostFunction {
            name: name.into(),
            suspendable: true,
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_suspendable(&self) -> bool {
        self.suspendable
    }

    pub fn invoke(&self, scope: &mut HostScope) -> LuaResult<HostReturn> {
        (self.f)(scope)
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("suspendable", &self.suspendable)
            .finish()
    }
}

/// Name-keyed host function table; snapshot restore resolves serialized
/// host references here.
#[derive(Default)]
pub struct HostRegistry {
    map: AHashMap<SmolStr, std::rc::Rc<HostFunction>>,
}

impl HostRegistry {
    pub fn new() -> HostRegistry {
        HostRegistry {
            map: AHashMap::new(),
        }
    }

    pub fn register(&mut self, f: std::rc::Rc<HostFunction>) {
        self.map.insert(SmolStr::new(f.name()), f);
    }

    pub fn lookup(&self, name: &str) -> Option<std::rc::Rc<HostFunction>> {
        self.map.get(name).cloned()
    }
}
