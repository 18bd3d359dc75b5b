// Disassembler for precompiled Lua 5.2 chunks, in the spirit of luac -l.

use std::env;
use std::fs;

use cryolua::{load_chunk, Instruction, LuaValue, Prototype};

fn main() {
    env_logger::init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: bytecode_dump <chunk.luac>");
        std::process::exit(1);
    };

    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("bytecode_dump: cannot open {}: {}", path, e);
            std::process::exit(1);
        }
    };

    match load_chunk(&bytes, &path) {
        Ok(proto) => dump_proto(&proto, true),
        Err(e) => {
            eprintln!("bytecode_dump: {}", e);
            std::process::exit(1);
        }
    }
}

fn dump_proto(proto: &Prototype, is_main: bool) {
    let kind = if is_main { "main" } else { "function" };
    println!(
        "{} <{}:{},{}> ({} instructions)",
        kind,
        proto.source,
        proto.line_defined,
        proto.last_line_defined,
        proto.code.len()
    );
    println!(
        "{} params, {} slots, {} upvalues, {} constants, {} functions",
        proto.num_params,
        proto.max_stack_size,
        proto.upvalue_descs.len(),
        proto.constants.len(),
        proto.protos.len()
    );

    for (pc, word) in proto.code.iter().enumerate() {
        let line = proto
            .line_at(pc)
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("\t{}\t[{}]\t{}", pc + 1, line, Instruction(*word));
    }

    if !proto.constants.is_empty() {
        println!("constants ({}):", proto.constants.len());
        for (i, k) in proto.constants.iter().enumerate() {
            match k {
                LuaValue::String(s) => println!("\t{}\t{:?}", i + 1, s.as_str()),
                other => println!("\t{}\t{}", i + 1, other.display_string()),
            }
        }
    }

    if !proto.upvalue_descs.is_empty() {
        println!("upvalues ({}):", proto.upvalue_descs.len());
        for (i, d) in proto.upvalue_descs.iter().enumerate() {
            println!("\t{}\t{}\t{}\t{}", i, d.name, d.instack as u8, d.idx);
        }
    }

    println!();
    for child in &proto.protos {
        dump_proto(child, false);
    }
}
