use std::cell::Cell;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use cryolua::{
    serialize_execution_context, HostFunction, HostReturn, LuaError, LuaValue, LuaVM, Outcome,
};
use log::info;

const VERSION: &str = "cryolua 0.1 (Lua 5.2 bytecode)";

fn print_usage() {
    eprintln!("usage: cryolua [options] <chunk.luac>");
    eprintln!("Available options are:");
    eprintln!("  -v                 show version information");
    eprintln!("  --resume <snap>    resume execution from a snapshot file");
    eprintln!("  --value <string>   return value delivered to the resumed call");
    eprintln!("  --stop <snap>      tear down a snapshot and exit");
    eprintln!("  --snap-out <file>  where a suspension writes its snapshot");
}

#[derive(Default)]
struct Options {
    chunk_file: Option<String>,
    resume_file: Option<String>,
    stop_file: Option<String>,
    return_value: Option<String>,
    snap_out: Option<String>,
    show_version: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-v" => opts.show_version = true,
            "--resume" => {
                i += 1;
                opts.resume_file = Some(
                    args.get(i)
                        .ok_or("'--resume' needs a snapshot file")?
                        .clone(),
                );
            }
            "--stop" => {
                i += 1;
                opts.stop_file = Some(
                    args.get(i).ok_or("'--stop' needs a snapshot file")?.clone(),
                );
            }
            "--value" => {
                i += 1;
                opts.return_value =
                    Some(args.get(i).ok_or("'--value' needs a string")?.clone());
            }
            "--snap-out" => {
                i += 1;
                opts.snap_out = Some(args.get(i).ok_or("'--snap-out' needs a file")?.clone());
            }
            other if other.starts_with('-') => {
                return Err(format!("unrecognized option '{}'", other));
            }
            _ => {
                opts.chunk_file = Some(args[i].clone());
            }
        }
        i += 1;
    }
    Ok(opts)
}

/// Bind the driver's host callables: `snapshot()` freezes the running
/// script to the snapshot file and suspends; `sleep(ms)` suspends and is
/// resumed in-process after the delay.
fn bind_host_functions(vm: &LuaVM, snap_path: PathBuf) -> (Rc<Cell<bool>>, Rc<Cell<i64>>) {
    let snapped = Rc::new(Cell::new(false));
    let sleep_ms = Rc::new(Cell::new(-1i64));

    let snapped_flag = snapped.clone();
    vm.register_global_host(HostFunction::suspendable("snapshot", move |scope| {
        let bytes = serialize_execution_context(&scope.stack).map_err(LuaError::host)?;
        fs::write(&snap_path, &bytes).map_err(LuaError::host)?;
        info!("snapshot written to {}", snap_path.display());
        snapped_flag.set(true);
        Ok(HostReturn::Suspend)
    }));

    let sleep_cell = sleep_ms.clone();
    vm.register_global_host(HostFunction::suspendable("sleep", move |scope| {
        let ms = scope.args.first().to_integer().unwrap_or(0).max(0);
        sleep_cell.set(ms);
        Ok(HostReturn::Suspend)
    }));

    (snapped, sleep_ms)
}

fn report(result: cryolua::Varargs) {
    let values = result.to_vec();
    if !values.is_empty() {
        let line: Vec<String> = values.iter().map(|v| v.display_string()).collect();
        println!("{}", line.join("\t"));
    }
}

fn run(opts: &Options) -> Result<(), String> {
    let vm = LuaVM::new();
    vm.open_basic_lib();

    if let Some(snap) = &opts.stop_file {
        let bytes = fs::read(snap).map_err(|e| format!("cannot open {}: {}", snap, e))?;
        bind_host_functions(&vm, PathBuf::from(format!("{}.next", snap)));
        let closure = vm
            .deserialize_execution_context(&bytes)
            .map_err(|e| e.to_string())?;
        vm.stop(&closure);
        match vm.suspendable_call(&closure, vec![]) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.full_report()),
        }
    } else if let Some(snap) = &opts.resume_file {
        let bytes = fs::read(snap).map_err(|e| format!("cannot open {}: {}", snap, e))?;
        let (snapped, sleep_ms) =
            bind_host_functions(&vm, PathBuf::from(format!("{}.next", snap)));
        let closure = vm
            .deserialize_execution_context(&bytes)
            .map_err(|e| e.to_string())?;
        if let Some(value) = &opts.return_value {
            vm.set_return_value(&closure, LuaValue::string(value.as_str()));
        }
        drive(&vm, &closure, &snapped, &sleep_ms)
    } else if let Some(file) = &opts.chunk_file {
        let bytes = fs::read(file).map_err(|e| format!("cannot open {}: {}", file, e))?;
        let snap_path = opts
            .snap_out
            .clone()
            .unwrap_or_else(|| format!("{}.snap", file));
        let (snapped, sleep_ms) = bind_host_functions(&vm, PathBuf::from(snap_path));
        let closure = vm.load(&bytes, file).map_err(|e| e.full_report())?;
        drive(&vm, &closure, &snapped, &sleep_ms)
    } else {
        print_usage();
        Err("no input".to_string())
    }
}

/// Drive a suspendable invocation: in-process sleeps are waited out and
/// resumed; a written snapshot detaches and leaves resumption to a later
/// `--resume` run.
fn drive(
    vm: &LuaVM,
    closure: &Rc<cryolua::LuaClosure>,
    snapped: &Rc<Cell<bool>>,
    sleep_ms: &Rc<Cell<i64>>,
) -> Result<(), String> {
    let mut args = Vec::new();
    loop {
        match vm.suspendable_call(closure, std::mem::take(&mut args)) {
            Ok(Outcome::Done(result)) => {
                report(result);
                return Ok(());
            }
            Ok(Outcome::Suspended) => {
                if snapped.get() {
                    println!("suspended; snapshot written");
                    return Ok(());
                }
                let ms = sleep_ms.replace(-1);
                if ms >= 0 {
                    std::thread::sleep(std::time::Duration::from_millis(ms as u64));
                    vm.set_return_value(closure, LuaValue::Nil);
                    continue;
                }
                return Err("script suspended with no pending driver action".to_string());
            }
            Err(e) => return Err(e.full_report()),
        }
    }
}

fn main() {
    env_logger::init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("cryolua: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    if opts.show_version {
        println!("{}", VERSION);
        if opts.chunk_file.is_none() && opts.resume_file.is_none() && opts.stop_file.is_none() {
            return;
        }
    }

    if let Err(e) = run(&opts) {
        eprintln!("cryolua: {}", e);
        std::process::exit(1);
    }
}
