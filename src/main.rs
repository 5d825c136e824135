// neutrino: a language runtime.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::env::args;
use std::process::exit;

use neutrino::behavior;
use neutrino::interp;
use neutrino::plankton;
use neutrino::runtime::{Runtime, RuntimeConfig};
use neutrino::syntax;
use neutrino::value::Condition;

struct Options {
    print_value: bool,
    gc_fuzz_freq: u64,
    gc_fuzz_seed: u64,
    main_options: Option<Vec<u8>>,
    files: Vec<String>,
}

fn parse_arguments() -> Result<Options, String> {
    let mut options = Options {
        print_value: false,
        gc_fuzz_freq: 0,
        gc_fuzz_seed: 0,
        main_options: None,
        files: Vec::new(),
    };
    let mut pending = args().skip(1);
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--print-value" => options.print_value = true,
            "--garbage-collect-fuzz-frequency" => {
                let value = pending.next().ok_or("missing fuzz frequency")?;
                options.gc_fuzz_freq = value.parse().map_err(|_| "bad fuzz frequency")?;
            }
            "--garbage-collect-fuzz-seed" => {
                let value = pending.next().ok_or("missing fuzz seed")?;
                options.gc_fuzz_seed = value.parse().map_err(|_| "bad fuzz seed")?;
            }
            "--main-options" => {
                let value = pending.next().ok_or("missing main options")?;
                let decoded = plankton::base64_decode(&value)
                    .map_err(|condition| format!("bad main options: {}", condition))?;
                options.main_options = Some(decoded);
            }
            file => options.files.push(file.to_owned()),
        }
    }
    if options.files.is_empty() {
        return Err("no input files".to_owned());
    }
    Ok(options)
}

// Runs one deserialized input: libraries register their modules,
// anything else is a program to compile and execute.
fn run_file(
    runtime: &mut Runtime,
    data: &[u8],
    name: &str,
    main_options: neutrino::heap::SafeValue,
    print_value: bool,
) -> Result<(), Condition> {
    // The deserialize-and-convert step restarts wholesale if the heap
    // runs out halfway through.
    let ast = runtime.retry_after_gc(|runtime| {
        let deserialized = plankton::deserialize(runtime, data)?;
        let type_key = neutrino::object::new_heap_utf8(runtime, "type")?;
        let is_library = neutrino::object::in_family(
            &runtime.heap,
            behavior::Family::Instance,
            deserialized,
        ) && match neutrino::object::get_instance_field(&runtime.heap, deserialized, type_key) {
            Ok(type_value) => {
                neutrino::object::get_utf8_contents(&runtime.heap, type_value) == "library"
            }
            Err(_) => false,
        };
        if is_library {
            return Ok(None);
        }
        syntax::ast_from_plankton(runtime, deserialized).map(Some)
    })?;
    let ast = match ast {
        Some(ast) => ast,
        None => return runtime.load_library_from_stream(data, name),
    };
    let s_ast = runtime.protect_value(ast);
    let fragment = runtime.retry_after_gc(|runtime| {
        let fragment = syntax::new_program_fragment(runtime)?;
        let namespace = neutrino::object::get_module_fragment_namespace(&runtime.heap, fragment);
        let options_value = runtime.heap.deref(main_options);
        syntax::bind_in_namespace(runtime, namespace, "main_options", options_value)?;
        Ok(fragment)
    });
    let result = fragment.and_then(|fragment| {
        let s_fragment = runtime.protect_value(fragment);
        let ast = runtime.heap.deref(s_ast);
        let result = (|runtime: &mut Runtime| {
            let fragment = runtime.heap.deref(s_fragment);
            let code = syntax::compile_expression(runtime, ast, fragment)?;
            // Compilation may have collected; re-resolve before
            // executing.
            let fragment = runtime.heap.deref(s_fragment);
            interp::execute_code_block(runtime, code, fragment)
        })(runtime);
        runtime.dispose_safe_value(s_fragment);
        result
    });
    runtime.dispose_safe_value(s_ast);
    let result = result?;
    if print_value {
        println!("{}", behavior::print_value(&runtime.heap, result));
    }
    Ok(())
}

fn main() {
    let options = match parse_arguments() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("Error: {}", message);
            exit(1);
        }
    };
    let config = RuntimeConfig {
        gc_fuzz_freq: options.gc_fuzz_freq,
        gc_fuzz_seed: options.gc_fuzz_seed,
        ..RuntimeConfig::default()
    };
    let mut runtime = match Runtime::new(&config) {
        Ok(runtime) => runtime,
        Err(condition) => {
            eprintln!("Error: {}", condition);
            exit(1);
        }
    };
    let main_options = match &options.main_options {
        Some(data) => match plankton::deserialize(&mut runtime, data) {
            Ok(value) => value,
            Err(condition) => {
                eprintln!("Error: {}", condition);
                exit(1);
            }
        },
        None => neutrino::value::null(),
    };
    // Collections move the options value, so hold it through a
    // tracker across files.
    let s_main_options = runtime.protect_value(main_options);
    for file in &options.files {
        let data = match runtime.file_system.read_file(file) {
            Ok(data) => data,
            Err(error) => {
                eprintln!("Error: {}: {}", file, error);
                exit(1);
            }
        };
        if let Err(condition) = run_file(
            &mut runtime,
            &data,
            file,
            s_main_options,
            options.print_value,
        ) {
            eprintln!("Error: {}", condition);
            exit(1);
        }
    }
    runtime.dispose_safe_value(s_main_options);
    if let Err(condition) = runtime.dispose() {
        eprintln!("Error: {}", condition);
        exit(1);
    }
}
