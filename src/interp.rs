// (C) 2020 Brandon Lewis
//
// The bytecode interpreter.
//
// A single-threaded dispatch loop over 16-bit opcodes with 16-bit
// operands. All intermediate state lives on the heap-allocated stack
// pieces, so a collection between opcodes is always safe: the loop
// closes the active frame, collects, and reopens the frame through
// the stack's safe value.
//
// Opcodes that allocate do all their allocation before touching the
// stack. When an allocation reports heap exhaustion the loop forces a
// collection and retries the same opcode once; a second exhaustion
// becomes OutOfMemory.
//
// Non-local control uses barriers. An escape records a resumption
// point; firing it walks the intervening barriers from the innermost
// out, running ensure sections in their own frames, until the escape
// itself is reached. Signals walk the same barrier chain looking for
// a signal handler section whose methodspace matches the raised
// invocation; the handler runs where the signal was raised and its
// result is delivered to the installing frame.

use crate::behavior;
use crate::method;
use crate::object;
use crate::process;
use crate::runtime::Runtime;
use crate::stack::{
    self, Frame, barrier_base_offset, barrier_size, get_barrier_extra, get_barrier_genus,
    get_barrier_payload, get_derived_object_host, get_section_block, push_barrier,
    set_barrier_payload, unlink_top_barrier, SECTION_EXTRA_DEST_PC,
    SECTION_EXTRA_FRAME_POINTER, SECTION_EXTRA_FRAME_POINTER_FIRST, SECTION_EXTRA_STACK_POINTER,
};
use crate::value::{
    self, Cause, Condition, Genus, Result, Value, is_nothing, nothing, null,
};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Push = 0,
    Pop = 1,
    Slap = 2,
    NewArray = 3,
    LoadLocal = 4,
    LoadArgument = 5,
    LoadRawArgument = 6,
    LoadLambdaCapture = 7,
    LoadRefractedLocal = 8,
    LoadRefractedArgument = 9,
    LoadRefractedCapture = 10,
    NewReference = 11,
    GetReference = 12,
    SetReference = 13,
    LoadGlobal = 14,
    Invoke = 15,
    SignalEscape = 16,
    SignalContinue = 17,
    CreateEscape = 18,
    FireEscapeOrBarrier = 19,
    DisposeEscape = 20,
    CreateEnsurer = 21,
    CallEnsurer = 22,
    DisposeEnsurer = 23,
    InstallSignalHandler = 24,
    UninstallSignalHandler = 25,
    Lambda = 26,
    CreateBlock = 27,
    DisposeBlock = 28,
    DelegateToLambda = 29,
    DelegateToBlock = 30,
    Builtin = 31,
    BuiltinMaybeEscape = 32,
    Goto = 33,
    Return = 34,
    UncheckedReturn = 35,
    StackBottom = 36,
    StackPieceBottom = 37,
    ReifyArguments = 38,
    CreateCallData = 39,
    CheckStackHeight = 40,
}

pub const OPCODE_COUNT: usize = 41;

pub struct OpcodeInfo {
    pub name: &'static str,
    pub operand_count: u64,
}

lazy_static! {
    // Operand arities, indexed by opcode. The disassembler and the
    // assembler's stack bookkeeping both lean on this table.
    pub static ref OPCODE_INFO: Vec<OpcodeInfo> = {
        let mut info = Vec::with_capacity(OPCODE_COUNT);
        let mut add = |name: &'static str, operand_count: u64| {
            info.push(OpcodeInfo { name, operand_count });
        };
        add("push", 1);
        add("pop", 1);
        add("slap", 1);
        add("new-array", 1);
        add("load-local", 1);
        add("load-argument", 1);
        add("load-raw-argument", 1);
        add("load-lambda-capture", 1);
        add("load-refracted-local", 2);
        add("load-refracted-argument", 2);
        add("load-refracted-capture", 2);
        add("new-reference", 0);
        add("get-reference", 0);
        add("set-reference", 0);
        add("load-global", 2);
        add("invoke", 3);
        add("signal-escape", 1);
        add("signal-continue", 1);
        add("create-escape", 1);
        add("fire-escape-or-barrier", 0);
        add("dispose-escape", 0);
        add("create-ensurer", 1);
        add("call-ensurer", 0);
        add("dispose-ensurer", 0);
        add("install-signal-handler", 2);
        add("uninstall-signal-handler", 0);
        add("lambda", 2);
        add("create-block", 1);
        add("dispose-block", 0);
        add("delegate-to-lambda", 0);
        add("delegate-to-block", 0);
        add("builtin", 1);
        add("builtin-maybe-escape", 2);
        add("goto", 1);
        add("return", 0);
        add("unchecked-return", 0);
        add("stack-bottom", 0);
        add("stack-piece-bottom", 0);
        add("reify-arguments", 1);
        add("create-call-data", 1);
        add("check-stack-height", 1);
        info
    };
}

impl Opcode {
    pub fn from_u16(raw: u16) -> Opcode {
        use Opcode::*;
        match raw {
            0 => Push,
            1 => Pop,
            2 => Slap,
            3 => NewArray,
            4 => LoadLocal,
            5 => LoadArgument,
            6 => LoadRawArgument,
            7 => LoadLambdaCapture,
            8 => LoadRefractedLocal,
            9 => LoadRefractedArgument,
            10 => LoadRefractedCapture,
            11 => NewReference,
            12 => GetReference,
            13 => SetReference,
            14 => LoadGlobal,
            15 => Invoke,
            16 => SignalEscape,
            17 => SignalContinue,
            18 => CreateEscape,
            19 => FireEscapeOrBarrier,
            20 => DisposeEscape,
            21 => CreateEnsurer,
            22 => CallEnsurer,
            23 => DisposeEnsurer,
            24 => InstallSignalHandler,
            25 => UninstallSignalHandler,
            26 => Lambda,
            27 => CreateBlock,
            28 => DisposeBlock,
            29 => DelegateToLambda,
            30 => DelegateToBlock,
            31 => Builtin,
            32 => BuiltinMaybeEscape,
            33 => Goto,
            34 => Return,
            35 => UncheckedReturn,
            36 => StackBottom,
            37 => StackPieceBottom,
            38 => ReifyArguments,
            39 => CreateCallData,
            40 => CheckStackHeight,
            _ => panic!("invalid opcode {}", raw),
        }
    }

    pub fn length(self) -> u64 {
        1 + OPCODE_INFO[self as usize].operand_count
    }
}

// Reads the 16-bit unit at the given index of a code block's blob.
pub fn get_short(heap: &crate::heap::Heap, code_block: Value, index: u64) -> u16 {
    let blob = object::get_code_block_bytecode(heap, code_block);
    let low = object::get_blob_byte_at(heap, blob, index * 2) as u16;
    let high = object::get_blob_byte_at(heap, blob, index * 2 + 1) as u16;
    (high << 8) | low
}

// A human-readable listing of a code block, one instruction per line.
pub fn disassemble(heap: &crate::heap::Heap, code_block: Value) -> String {
    let blob = object::get_code_block_bytecode(heap, code_block);
    let shorts = object::get_blob_length(heap, blob) / 2;
    let mut result = String::new();
    let mut cursor = 0;
    while cursor < shorts {
        let opcode = Opcode::from_u16(get_short(heap, code_block, cursor));
        let info = &OPCODE_INFO[opcode as usize];
        result.push_str(&format!("{:4}: {}", cursor, info.name));
        for i in 0..info.operand_count {
            result.push_str(&format!(" {}", get_short(heap, code_block, cursor + 1 + i)));
        }
        result.push('\n');
        cursor += opcode.length();
    }
    result
}

// Builds the one-instruction code blocks that cap stacks and pieces.
pub fn new_capping_code_block(runtime: &mut Runtime, opcode: Opcode) -> Result<Value> {
    let bytes = [(opcode as u16 & 0xFF) as u8, (opcode as u16 >> 8) as u8];
    let blob = object::new_heap_blob_with_data(runtime, &bytes)?;
    let empty = runtime.root(crate::runtime::NamedRoot::EmptyArray);
    object::new_heap_code_block(runtime, blob, empty, 1)
}


// --- B u i l t i n s ---

// Arguments as seen by a native implementation: the subject is
// parameter zero, the selector parameter one, positionals follow.
pub struct BuiltinArguments {
    pub frame: Frame,
}

impl BuiltinArguments {
    pub fn subject(&self, heap: &crate::heap::Heap) -> Value {
        self.frame.get_argument(heap, 0)
    }

    pub fn argument(&self, heap: &crate::heap::Heap, index: u64) -> Value {
        self.frame.get_argument(heap, 2 + index)
    }
}

pub type BuiltinFn = fn(&mut Runtime, &BuiltinArguments) -> Result<Value>;

// An entry in the runtime's builtin table: either a native function
// or a plugin service trampoline.
#[derive(Copy, Clone)]
pub enum BuiltinImpl {
    Native(BuiltinFn),
    Service(crate::plugin::ServiceCallback),
}

fn call_builtin(
    runtime: &mut Runtime,
    builtin: BuiltinImpl,
    arguments: &BuiltinArguments,
) -> Result<Value> {
    match builtin {
        BuiltinImpl::Native(function) => function(runtime, arguments),
        BuiltinImpl::Service(callback) => {
            crate::plugin::invoke_service_callback(runtime, callback, arguments)
        }
    }
}


// --- T h e   l o o p ---

enum Flow {
    // Move past the current instruction.
    Advance,
    // The handler already repositioned the pc or switched frames.
    Stay,
    // Execution finished with this value.
    Done(Value),
}

// Runs the code block on a fresh process and returns its result.
// This is the runtime's execution entry point.
pub fn execute_code_block(runtime: &mut Runtime, code_block: Value, fragment: Value) -> Result<Value> {
    let s_code = runtime.protect_value(code_block);
    let s_fragment = runtime.protect_value(fragment);
    let process = runtime.retry_after_gc(|runtime| process::new_heap_process(runtime))?;
    let task = process::get_process_root_task(&runtime.heap, process);
    let stack = process::get_task_stack(&runtime.heap, task);
    let s_stack = runtime.protect_value(stack);
    let result = (|| {
        let mut frame = runtime.retry_after_gc(|runtime| {
            let code_block = runtime.heap.deref(s_code);
            let stack = runtime.heap.deref(s_stack);
            let empty_map = runtime.roots().empty_array;
            let mut frame = Frame::open(&runtime.heap, stack);
            stack::push_stack_frame(runtime, &mut frame, code_block, 0, empty_map)?;
            Ok(frame)
        })?;
        interpret(runtime, s_stack, &mut frame, s_fragment, false)
    })();
    runtime.dispose_safe_value(s_stack);
    runtime.dispose_safe_value(s_fragment);
    runtime.dispose_safe_value(s_code);
    result
}

// The dispatch loop. In nested mode the loop finishes when the frame
// it was entered with returns, which is how ensure blocks and signal
// handlers run inside an outer execution.
fn interpret(
    runtime: &mut Runtime,
    s_stack: crate::heap::SafeValue,
    frame: &mut Frame,
    s_fragment: crate::heap::SafeValue,
    nested: bool,
) -> Result<Value> {
    let mut depth: u64 = 1;
    let mut retried_pc: Option<u64> = None;
    loop {
        let code_block = frame.code_block(&runtime.heap);
        let opcode = Opcode::from_u16(get_short(&runtime.heap, code_block, frame.pc));
        let entry_pc = frame.pc;
        let entry_sp = frame.stack_pointer;
        match step(runtime, s_stack, frame, s_fragment, code_block, opcode, &mut depth, nested) {
            Ok(Flow::Advance) => {
                frame.pc += opcode.length();
                retried_pc = None;
            }
            Ok(Flow::Stay) => {
                retried_pc = None;
            }
            Ok(Flow::Done(value)) => return Ok(value),
            Err(condition) if condition.cause() == Cause::HeapExhausted => {
                // Collect and retry this opcode once. Handlers finish
                // their allocations before committing stack effects,
                // so rewinding the cursor makes the retry safe.
                if retried_pc == Some(entry_pc) {
                    return Err(Condition::out_of_memory());
                }
                retried_pc = Some(entry_pc);
                frame.pc = entry_pc;
                frame.stack_pointer = entry_sp;
                frame.close(&mut runtime.heap);
                let fuzzing = runtime.heap.fuzzer.as_ref().map_or(false, |f| f.is_enabled());
                if fuzzing {
                    runtime.heap.toggle_fuzzing(false);
                }
                let collected = runtime.garbage_collect();
                if fuzzing {
                    runtime.heap.toggle_fuzzing(true);
                }
                collected?;
                let stack = runtime.heap.deref(s_stack);
                *frame = Frame::open(&runtime.heap, stack);
            }
            Err(condition) => return Err(condition),
        }
    }
}

fn operand(heap: &crate::heap::Heap, code_block: Value, pc: u64, index: u64) -> u64 {
    get_short(heap, code_block, pc + 1 + index) as u64
}

fn pool_value(heap: &crate::heap::Heap, code_block: Value, index: u64) -> Value {
    let pool = object::get_code_block_value_pool(heap, code_block);
    object::get_array_at(heap, pool, index)
}

fn step(
    runtime: &mut Runtime,
    s_stack: crate::heap::SafeValue,
    frame: &mut Frame,
    s_fragment: crate::heap::SafeValue,
    code_block: Value,
    opcode: Opcode,
    depth: &mut u64,
    nested: bool,
) -> Result<Flow> {
    let pc = frame.pc;
    match opcode {
        Opcode::Push => {
            let value = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::Pop => {
            let count = operand(&runtime.heap, code_block, pc, 0);
            frame.stack_pointer -= count;
            Ok(Flow::Advance)
        }
        Opcode::Slap => {
            let count = operand(&runtime.heap, code_block, pc, 0);
            let top = frame.pop(&runtime.heap);
            frame.stack_pointer -= count;
            frame.push(&mut runtime.heap, top);
            Ok(Flow::Advance)
        }
        Opcode::NewArray => {
            let length = operand(&runtime.heap, code_block, pc, 0);
            let array = object::new_heap_array(runtime, length)?;
            for i in 0..length {
                let value = frame.peek(&runtime.heap, length - 1 - i);
                object::set_array_at(&mut runtime.heap, array, i, value);
            }
            frame.stack_pointer -= length;
            frame.push(&mut runtime.heap, array);
            Ok(Flow::Advance)
        }
        Opcode::LoadLocal => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let value = frame.get_local(&runtime.heap, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadArgument => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let value = frame.get_argument(&runtime.heap, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadRawArgument => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let value = frame.get_raw_argument(&runtime.heap, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadLambdaCapture => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let lambda = frame.get_argument(&runtime.heap, 0);
            let value = object::get_lambda_capture(&runtime.heap, lambda, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadRefractedLocal => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let block_depth = operand(&runtime.heap, code_block, pc, 1);
            let (piece, fp) = refracted_frame(&runtime.heap, frame, block_depth);
            let value = stack::get_storage_at(&runtime.heap, piece, fp + index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadRefractedArgument => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let block_depth = operand(&runtime.heap, code_block, pc, 1);
            let (piece, fp) = refracted_frame(&runtime.heap, frame, block_depth);
            let distant = Frame { piece, frame_pointer: fp, ..*frame };
            let value = distant.get_argument(&runtime.heap, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadRefractedCapture => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let block_depth = operand(&runtime.heap, code_block, pc, 1);
            let (piece, fp) = refracted_frame(&runtime.heap, frame, block_depth);
            let distant = Frame { piece, frame_pointer: fp, ..*frame };
            let lambda = distant.get_argument(&runtime.heap, 0);
            let value = object::get_lambda_capture(&runtime.heap, lambda, index);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::NewReference => {
            let current = frame.peek(&runtime.heap, 0);
            let reference = object::new_heap_reference(runtime, current)?;
            frame.poke(&mut runtime.heap, 0, reference);
            Ok(Flow::Advance)
        }
        Opcode::GetReference => {
            let reference = frame.peek(&runtime.heap, 0);
            let value = object::get_reference_value(&runtime.heap, reference);
            frame.poke(&mut runtime.heap, 0, value);
            Ok(Flow::Advance)
        }
        Opcode::SetReference => {
            let value = frame.pop(&runtime.heap);
            let reference = frame.pop(&runtime.heap);
            object::set_reference_value(&mut runtime.heap, reference, value);
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::LoadGlobal => {
            let path = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let fragment = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 1));
            let namespace = object::get_module_fragment_namespace(&runtime.heap, fragment);
            let value = object::namespace_lookup(&runtime.heap, namespace, path)?;
            frame.push(&mut runtime.heap, value);
            Ok(Flow::Advance)
        }
        Opcode::Invoke => {
            let tags = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let fragment = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 1));
            let next_guards = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 2));
            let space = if is_nothing(fragment) {
                runtime.roots().builtin_methodspace
            } else {
                object::get_module_fragment_methodspace(&runtime.heap, fragment)
            };
            // The cached selector slice narrows the search; the
            // methodspace still resolves inheritance.
            let selector_offset = method::get_call_tags_selector_offset(&runtime.heap, tags);
            let outcome = if selector_offset.is_integer() && is_nothing(next_guards) {
                let selector = frame.peek(&runtime.heap, selector_offset.as_integer() as u64);
                let slice =
                    method::get_or_create_methodspace_selector_slice(runtime, space, selector)?;
                method::lookup_sigmap_method_from_frame(runtime, slice, space, tags, *frame)?
            } else {
                method::lookup_method_full_from_frame(runtime, space, tags, *frame, next_guards)?
            };
            let method_value = outcome.result.to_result()?;
            let argument_map = method::build_argument_map(runtime, &outcome.offsets)?;
            let code = method::get_method_code(&runtime.heap, method_value);
            if is_nothing(code) {
                return Err(Condition::unknown_builtin());
            }
            let argc = method::get_call_tags_entry_count(&runtime.heap, tags);
            frame.pc += Opcode::Invoke.length();
            stack::push_stack_frame(runtime, frame, code, argc, argument_map)?;
            *depth += 1;
            Ok(Flow::Stay)
        }
        Opcode::Return | Opcode::UncheckedReturn => {
            if nested && *depth == 1 {
                let result = frame.pop(&runtime.heap);
                frame.pop_frame(&runtime.heap);
                return Ok(Flow::Done(result));
            }
            *depth = depth.saturating_sub(1);
            let result = frame.pop(&runtime.heap);
            frame.pop_frame(&runtime.heap);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Stay)
        }
        Opcode::StackBottom => {
            let result = frame.pop(&runtime.heap);
            Ok(Flow::Done(result))
        }
        Opcode::StackPieceBottom => {
            let result = frame.pop(&runtime.heap);
            stack::pop_stack_piece(&mut runtime.heap, frame);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Stay)
        }
        Opcode::Goto => {
            frame.pc = operand(&runtime.heap, code_block, pc, 0);
            Ok(Flow::Stay)
        }
        Opcode::CheckStackHeight => {
            let expected = operand(&runtime.heap, code_block, pc, 0);
            debug_assert_eq!(
                frame.stack_pointer - frame.frame_pointer,
                expected,
                "stack height drifted"
            );
            Ok(Flow::Advance)
        }
        Opcode::Lambda => {
            let methods = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let capture_count = operand(&runtime.heap, code_block, pc, 1);
            let captures = if capture_count == 0 {
                runtime.roots().empty_array
            } else {
                object::new_heap_array(runtime, capture_count)?
            };
            let lambda = object::new_heap_lambda(runtime, methods, captures)?;
            for i in 0..capture_count {
                let value = frame.peek(&runtime.heap, capture_count - 1 - i);
                object::set_array_at(&mut runtime.heap, captures, i, value);
            }
            frame.stack_pointer -= capture_count;
            frame.push(&mut runtime.heap, lambda);
            Ok(Flow::Advance)
        }
        Opcode::CreateBlock => {
            let methods = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let block = object::new_heap_block(runtime, nothing())?;
            let fp = frame.frame_pointer;
            let section = push_barrier(
                &mut runtime.heap,
                frame,
                Genus::BlockSection,
                methods,
                &[Value::new_integer(fp as i64), block],
            );
            object::set_block_section(&mut runtime.heap, block, section);
            frame.push(&mut runtime.heap, block);
            Ok(Flow::Advance)
        }
        Opcode::DisposeBlock => {
            let result = frame.pop(&runtime.heap);
            let block = frame.pop(&runtime.heap);
            object::set_block_live(&mut runtime.heap, block, false);
            unlink_top_barrier(&mut runtime.heap, frame.stack);
            frame.stack_pointer -= barrier_size(Genus::BlockSection);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Advance)
        }
        Opcode::DelegateToLambda => {
            let lambda = frame.get_argument(&runtime.heap, 0);
            let space = object::get_lambda_methods(&runtime.heap, lambda);
            delegate_through(runtime, frame, depth, space)
        }
        Opcode::DelegateToBlock => {
            let block = frame.get_argument(&runtime.heap, 0);
            let section = object::get_block_section(&runtime.heap, block);
            let space = stack::get_block_section_methodspace(&runtime.heap, section);
            delegate_through(runtime, frame, depth, space)
        }
        Opcode::Builtin => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let builtin = runtime.builtins[index as usize];
            let arguments = BuiltinArguments { frame: *frame };
            let result = call_builtin(runtime, builtin, &arguments)?;
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Advance)
        }
        Opcode::BuiltinMaybeEscape => {
            let index = operand(&runtime.heap, code_block, pc, 0);
            let builtin = runtime.builtins[index as usize];
            let arguments = BuiltinArguments { frame: *frame };
            match call_builtin(runtime, builtin, &arguments) {
                Ok(result) => {
                    frame.push(&mut runtime.heap, result);
                    Ok(Flow::Advance)
                }
                // A signalling builtin aborts like an unhandled
                // escaping signal.
                Err(condition) if condition.cause() == Cause::Signal => {
                    Err(Condition::uncaught_signal(true))
                }
                Err(condition) => Err(condition),
            }
        }
        Opcode::CreateEscape => {
            let dest = operand(&runtime.heap, code_block, pc, 0);
            let sp_before = frame.stack_pointer;
            let escape = push_barrier(
                &mut runtime.heap,
                frame,
                Genus::EscapeSection,
                value::yes(),
                &[
                    Value::new_integer(dest as i64),
                    Value::new_integer(frame.frame_pointer as i64),
                    Value::new_integer(sp_before as i64),
                ],
            );
            frame.push(&mut runtime.heap, escape);
            Ok(Flow::Advance)
        }
        Opcode::DisposeEscape => {
            let result = frame.pop(&runtime.heap);
            let escape = frame.pop(&runtime.heap);
            debug_assert!(escape.is_derived_object());
            set_barrier_payload(&mut runtime.heap, escape, value::no());
            unlink_top_barrier(&mut runtime.heap, frame.stack);
            frame.stack_pointer -= barrier_size(Genus::EscapeSection);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Advance)
        }
        Opcode::FireEscapeOrBarrier => {
            let fired_value = frame.pop(&runtime.heap);
            let escape = frame.pop(&runtime.heap);
            if !escape.is_derived_object()
                || get_barrier_genus(&runtime.heap, escape) != Genus::EscapeSection
            {
                return Err(Condition::invalid_input_hint("fire"));
            }
            if !value::get_boolean_value(get_barrier_payload(&runtime.heap, escape)) {
                // One-shot: a dead escape cannot fire again.
                return Err(Condition::invalid_input_hint("dead"));
            }
            unwind_to_barrier(runtime, s_stack, frame, s_fragment, escape)?;
            // Arrived at the escape: restore the creating frame.
            let dest =
                get_barrier_extra(&runtime.heap, escape, SECTION_EXTRA_DEST_PC).as_integer() as u64;
            let fp = get_barrier_extra(&runtime.heap, escape, SECTION_EXTRA_FRAME_POINTER)
                .as_integer() as u64;
            let sp = get_barrier_extra(&runtime.heap, escape, SECTION_EXTRA_STACK_POINTER)
                .as_integer() as u64;
            set_barrier_payload(&mut runtime.heap, escape, value::no());
            unlink_top_barrier(&mut runtime.heap, frame.stack);
            restore_section_frame(runtime, frame, escape, fp, sp, dest);
            frame.push(&mut runtime.heap, fired_value);
            Ok(Flow::Stay)
        }
        Opcode::CreateEnsurer => {
            let ensurer_code =
                pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            // The cleanup code reaches this frame's state through the
            // block carried by the section.
            let block = object::new_heap_block(runtime, nothing())?;
            let fp = frame.frame_pointer;
            let section = push_barrier(
                &mut runtime.heap,
                frame,
                Genus::EnsureSection,
                ensurer_code,
                &[Value::new_integer(fp as i64), block],
            );
            object::set_block_section(&mut runtime.heap, block, section);
            Ok(Flow::Advance)
        }
        Opcode::CallEnsurer => {
            // Stack: [barrier][body result]; the cleanup runs on top
            // and its result is discarded.
            let barrier = frame.top_barrier(&runtime.heap);
            debug_assert!(get_barrier_genus(&runtime.heap, barrier) == Genus::EnsureSection);
            run_ensurer_inline(runtime, s_stack, frame, s_fragment, barrier)?;
            Ok(Flow::Advance)
        }
        Opcode::DisposeEnsurer => {
            let result = frame.pop(&runtime.heap);
            unlink_top_barrier(&mut runtime.heap, frame.stack);
            frame.stack_pointer -= barrier_size(Genus::EnsureSection);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Advance)
        }
        Opcode::InstallSignalHandler => {
            let space = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let dest = operand(&runtime.heap, code_block, pc, 1);
            let sp_before = frame.stack_pointer;
            push_barrier(
                &mut runtime.heap,
                frame,
                Genus::SignalHandlerSection,
                space,
                &[
                    Value::new_integer(dest as i64),
                    Value::new_integer(frame.frame_pointer as i64),
                    Value::new_integer(sp_before as i64),
                ],
            );
            Ok(Flow::Advance)
        }
        Opcode::UninstallSignalHandler => {
            let result = frame.pop(&runtime.heap);
            unlink_top_barrier(&mut runtime.heap, frame.stack);
            frame.stack_pointer -= barrier_size(Genus::SignalHandlerSection);
            frame.push(&mut runtime.heap, result);
            Ok(Flow::Advance)
        }
        Opcode::SignalEscape | Opcode::SignalContinue => {
            let tags = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let argc = method::get_call_tags_entry_count(&runtime.heap, tags);
            let outcome =
                method::lookup_signal_handler_method_from_frame(runtime, tags, *frame)?;
            match outcome.result.to_result() {
                Ok(handler_method) => {
                    let handler = outcome.handler;
                    let argument_map = method::build_argument_map(runtime, &outcome.offsets)?;
                    let handler_code = method::get_method_code(&runtime.heap, handler_method);
                    // The handler runs at the raise site, against the
                    // raised arguments.
                    frame.pc += opcode.length();
                    frame.write_header_pc(&mut runtime.heap);
                    let result = run_method_inline(
                        runtime,
                        s_stack,
                        frame,
                        s_fragment,
                        handler_code,
                        argc,
                        argument_map,
                    )?;
                    if opcode == Opcode::SignalEscape {
                        // Leave at the handler's frame, firing every
                        // barrier in between.
                        unwind_to_barrier(runtime, s_stack, frame, s_fragment, handler)?;
                        let dest = get_barrier_extra(&runtime.heap, handler, SECTION_EXTRA_DEST_PC)
                            .as_integer() as u64;
                        let fp =
                            get_barrier_extra(&runtime.heap, handler, SECTION_EXTRA_FRAME_POINTER)
                                .as_integer() as u64;
                        let sp =
                            get_barrier_extra(&runtime.heap, handler, SECTION_EXTRA_STACK_POINTER)
                                .as_integer() as u64;
                        unlink_top_barrier(&mut runtime.heap, frame.stack);
                        restore_section_frame(runtime, frame, handler, fp, sp, dest);
                        frame.push(&mut runtime.heap, result);
                        Ok(Flow::Stay)
                    } else {
                        // A continuing signal resumes here with the
                        // handler's result; the handler frame already
                        // consumed the raised arguments.
                        frame.push(&mut runtime.heap, result);
                        Ok(Flow::Stay)
                    }
                }
                Err(_) => {
                    if opcode == Opcode::SignalEscape {
                        Err(Condition::uncaught_signal(true))
                    } else {
                        // Fall through to the default branch with no
                        // handler value.
                        frame.stack_pointer -= argc;
                        frame.push(&mut runtime.heap, null());
                        Ok(Flow::Advance)
                    }
                }
            }
        }
        Opcode::ReifyArguments => {
            let tags = pool_value(&runtime.heap, code_block, operand(&runtime.heap, code_block, pc, 0));
            let argc = frame.argument_count(&runtime.heap);
            let values = object::new_heap_array(runtime, argc)?;
            for i in 0..argc {
                let value = frame.get_raw_argument(&runtime.heap, i);
                object::set_array_at(&mut runtime.heap, values, i, value);
            }
            let call_data = method::new_heap_call_data(runtime, tags, values)?;
            frame.push(&mut runtime.heap, call_data);
            Ok(Flow::Advance)
        }
        Opcode::CreateCallData => {
            // The top argc pairs are (tag, value), pushed in
            // evaluation order.
            let argc = operand(&runtime.heap, code_block, pc, 0);
            let tag_array = object::new_heap_array(runtime, argc)?;
            let values = object::new_heap_array(runtime, argc)?;
            for i in 0..argc {
                let value = frame.peek(&runtime.heap, (argc - 1 - i) * 2);
                let tag = frame.peek(&runtime.heap, (argc - 1 - i) * 2 + 1);
                object::set_array_at(&mut runtime.heap, tag_array, i, tag);
                object::set_array_at(&mut runtime.heap, values, i, value);
            }
            let tags = method::new_heap_call_tags_from_evaluation_order(runtime, tag_array)?;
            let call_data = method::new_heap_call_data(runtime, tags, values)?;
            frame.stack_pointer -= argc * 2;
            frame.push(&mut runtime.heap, call_data);
            Ok(Flow::Advance)
        }
    }
}

// Runs an ensure section's cleanup code and returns its result. The
// cleanup executes in its own frame with the section's block as its
// subject, so refracted reads reach the creating frame.
fn run_ensurer_inline(
    runtime: &mut Runtime,
    s_stack: crate::heap::SafeValue,
    frame: &mut Frame,
    s_fragment: crate::heap::SafeValue,
    barrier: Value,
) -> Result<Value> {
    let code = get_barrier_payload(&runtime.heap, barrier);
    let block = get_section_block(&runtime.heap, barrier);
    let argument_map = method::build_argument_map(runtime, &[0])?;
    frame.write_header_pc(&mut runtime.heap);
    frame.push(&mut runtime.heap, block);
    stack::push_stack_frame(runtime, frame, code, 1, argument_map)?;
    interpret(runtime, s_stack, frame, s_fragment, true)
}

// Runs a method body against argc arguments already on the stack and
// returns its result. Used for signal handlers.
fn run_method_inline(
    runtime: &mut Runtime,
    s_stack: crate::heap::SafeValue,
    frame: &mut Frame,
    s_fragment: crate::heap::SafeValue,
    code: Value,
    argc: u64,
    argument_map: Value,
) -> Result<Value> {
    stack::push_stack_frame(runtime, frame, code, argc, argument_map)?;
    interpret(runtime, s_stack, frame, s_fragment, true)
}

// Re-dispatches the current invocation against the given methodspace
// and transfers into the winner. This is the slow path behind lambda
// and block calls: the delegate method's frame holds the original
// arguments in evaluation order.
fn delegate_through(
    runtime: &mut Runtime,
    frame: &mut Frame,
    depth: &mut u64,
    space: Value,
) -> Result<Flow> {
    let argc = frame.argument_count(&runtime.heap);
    // Rebuild the canonical tags: calls arrive as subject, selector,
    // then positionals in evaluation order.
    let subject_key = runtime.roots().subject_key;
    let selector_key = runtime.roots().selector_key;
    let tag_array = object::new_heap_array(runtime, argc)?;
    object::set_array_at(&mut runtime.heap, tag_array, 0, subject_key);
    object::set_array_at(&mut runtime.heap, tag_array, 1, selector_key);
    for i in 2..argc {
        object::set_array_at(&mut runtime.heap, tag_array, i, Value::new_integer(i as i64 - 2));
    }
    let tags = method::new_heap_call_tags_from_evaluation_order(runtime, tag_array)?;
    let values = object::new_heap_array(runtime, argc)?;
    for i in 0..argc {
        let value = frame.get_raw_argument(&runtime.heap, i);
        object::set_array_at(&mut runtime.heap, values, i, value);
    }
    let call_data = method::new_heap_call_data(runtime, tags, values)?;
    let outcome = method::lookup_method_full_from_call_data(runtime, space, call_data)?;
    let method_value = outcome.result.to_result()?;
    let argument_map = method::build_argument_map(runtime, &outcome.offsets)?;
    let code = method::get_method_code(&runtime.heap, method_value);
    // Re-push the arguments and enter the inner method; when it
    // returns, the delegate method returns its value through.
    frame.pc += Opcode::DelegateToLambda.length();
    for i in 0..argc {
        let value = object::get_array_at(&runtime.heap, values, i);
        frame.push(&mut runtime.heap, value);
    }
    stack::push_stack_frame(runtime, frame, code, argc, argument_map)?;
    *depth += 1;
    Ok(Flow::Stay)
}

// Walks the chain of threaded locals of a block subject: each level
// follows the current frame's subject block to the frame its section
// lives in.
fn refracted_frame(heap: &crate::heap::Heap, frame: &Frame, block_depth: u64) -> (Value, u64) {
    let mut piece = frame.piece;
    let mut fp = frame.frame_pointer;
    for _ in 0..block_depth {
        let distant = Frame { piece, frame_pointer: fp, ..*frame };
        let block = distant.get_argument(heap, 0);
        let section = object::get_block_section(heap, block);
        piece = get_derived_object_host(heap, section);
        fp = stack::get_block_section_frame_pointer(heap, section);
    }
    (piece, fp)
}

// Restores execution to the frame a section was created in. The
// frame's header still describes it; only the position and the pc
// move.
fn restore_section_frame(
    runtime: &mut Runtime,
    frame: &mut Frame,
    section: Value,
    fp: u64,
    sp: u64,
    dest: u64,
) {
    let piece = get_derived_object_host(&runtime.heap, section);
    stack::set_stack_top_piece(&mut runtime.heap, frame.stack, piece);
    frame.reopen_at(&runtime.heap, piece, fp, sp);
    frame.pc = dest;
}

// Fires every barrier between the top of the stack and the target,
// innermost first: ensure sections run their cleanup in the context
// of the frame that created them, handler and block sections are
// uninstalled.
fn unwind_to_barrier(
    runtime: &mut Runtime,
    s_stack: crate::heap::SafeValue,
    frame: &mut Frame,
    s_fragment: crate::heap::SafeValue,
    target: Value,
) -> Result<()> {
    loop {
        let barrier = frame.top_barrier(&runtime.heap);
        debug_assert!(!is_nothing(barrier), "unwinding past the target barrier");
        if barrier.is_same(target) {
            return Ok(());
        }
        match get_barrier_genus(&runtime.heap, barrier) {
            Genus::EnsureSection => {
                let fp = get_barrier_extra(&runtime.heap, barrier, SECTION_EXTRA_FRAME_POINTER_FIRST)
                    .as_integer() as u64;
                // Discard the dead slots above the section before
                // running the cleanup there.
                let base = barrier_base_offset(&runtime.heap, barrier);
                restore_section_frame(runtime, frame, barrier, fp, base + barrier_size(Genus::EnsureSection), 0);
                run_ensurer_inline(runtime, s_stack, frame, s_fragment, barrier)?;
                unlink_top_barrier(&mut runtime.heap, frame.stack);
                frame.stack_pointer = base;
            }
            Genus::BlockSection => {
                let block = get_section_block(&runtime.heap, barrier);
                object::set_block_live(&mut runtime.heap, block, false);
                unlink_top_barrier(&mut runtime.heap, frame.stack);
            }
            Genus::SignalHandlerSection | Genus::EscapeSection => {
                unlink_top_barrier(&mut runtime.heap, frame.stack);
            }
        }
    }
}


// --- B u i l t i n   i n s t a l l a t i o n ---

fn builtin_integer_add(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap).as_integer();
    let b = args.argument(&runtime.heap, 0).as_integer();
    Ok(Value::new_integer(a.wrapping_add(b)))
}

fn builtin_integer_subtract(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap).as_integer();
    let b = args.argument(&runtime.heap, 0).as_integer();
    Ok(Value::new_integer(a.wrapping_sub(b)))
}

fn builtin_integer_multiply(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap).as_integer();
    let b = args.argument(&runtime.heap, 0).as_integer();
    Ok(Value::new_integer(a.wrapping_mul(b)))
}

fn builtin_integer_negate(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap).as_integer();
    Ok(Value::new_integer(-a))
}

fn builtin_integer_equals(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap);
    let b = args.argument(&runtime.heap, 0);
    Ok(value::new_boolean(a.is_same(b)))
}

fn builtin_integer_less(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap).as_integer();
    let b = args.argument(&runtime.heap, 0).as_integer();
    Ok(value::new_boolean(a < b))
}

fn builtin_boolean_negate(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = value::get_boolean_value(args.subject(&runtime.heap));
    Ok(value::new_boolean(!a))
}

fn builtin_array_length(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let array = args.subject(&runtime.heap);
    Ok(Value::new_integer(object::get_array_length(&runtime.heap, array) as i64))
}

fn builtin_array_get(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let array = args.subject(&runtime.heap);
    let index = args.argument(&runtime.heap, 0).as_integer();
    if index < 0 || index as u64 >= object::get_array_length(&runtime.heap, array) {
        return Err(Condition::signal());
    }
    Ok(object::get_array_at(&runtime.heap, array, index as u64))
}

fn builtin_string_size(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let string = args.subject(&runtime.heap);
    Ok(Value::new_integer(object::get_utf8_length(&runtime.heap, string) as i64))
}

fn builtin_string_equals(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let a = args.subject(&runtime.heap);
    let b = args.argument(&runtime.heap, 0);
    Ok(value::new_boolean(object::utf8_equals(&runtime.heap, a, b)))
}

fn builtin_call_data_length(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let call_data = args.subject(&runtime.heap);
    let values = method::get_call_data_values(&runtime.heap, call_data);
    Ok(Value::new_integer(object::get_array_length(&runtime.heap, values) as i64))
}

fn builtin_call_data_get(runtime: &mut Runtime, args: &BuiltinArguments) -> Result<Value> {
    let call_data = args.subject(&runtime.heap);
    let needle = args.argument(&runtime.heap, 0);
    let tags = method::get_call_data_tags(&runtime.heap, call_data);
    let count = method::get_call_tags_entry_count(&runtime.heap, tags);
    for i in 0..count {
        let tag = method::get_call_tags_tag_at(&runtime.heap, tags, i);
        if behavior::value_identity_compare(&runtime.heap, tag, needle)? {
            return Ok(method::get_call_data_value_at(&runtime.heap, call_data, i));
        }
    }
    Err(Condition::signal())
}

// The guard the subject parameter of a builtin method carries.
enum SubjectGuard {
    IsType(crate::runtime::NamedRoot),
    Any,
}

struct BuiltinSpec {
    name: &'static str,
    subject: SubjectGuard,
    selector: &'static str,
    positional_count: u64,
    implementation: BuiltinFn,
}

fn builtin_specs() -> Vec<BuiltinSpec> {
    use crate::runtime::NamedRoot::*;
    vec![
        BuiltinSpec {
            name: "integer+integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "+",
            positional_count: 1,
            implementation: builtin_integer_add,
        },
        BuiltinSpec {
            name: "integer-integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "-",
            positional_count: 1,
            implementation: builtin_integer_subtract,
        },
        BuiltinSpec {
            name: "integer*integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "*",
            positional_count: 1,
            implementation: builtin_integer_multiply,
        },
        BuiltinSpec {
            name: "-integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "negate",
            positional_count: 0,
            implementation: builtin_integer_negate,
        },
        BuiltinSpec {
            name: "integer==integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "==",
            positional_count: 1,
            implementation: builtin_integer_equals,
        },
        BuiltinSpec {
            name: "integer<integer",
            subject: SubjectGuard::IsType(IntegerType),
            selector: "<",
            positional_count: 1,
            implementation: builtin_integer_less,
        },
        BuiltinSpec {
            name: "bool.negate",
            subject: SubjectGuard::IsType(BooleanType),
            selector: "negate",
            positional_count: 0,
            implementation: builtin_boolean_negate,
        },
        BuiltinSpec {
            name: "array.length",
            subject: SubjectGuard::IsType(ArrayType),
            selector: "length",
            positional_count: 0,
            implementation: builtin_array_length,
        },
        BuiltinSpec {
            name: "array[]",
            subject: SubjectGuard::IsType(ArrayType),
            selector: "[]",
            positional_count: 1,
            implementation: builtin_array_get,
        },
        BuiltinSpec {
            name: "string.size",
            subject: SubjectGuard::IsType(StringType),
            selector: "size",
            positional_count: 0,
            implementation: builtin_string_size,
        },
        BuiltinSpec {
            name: "string==string",
            subject: SubjectGuard::IsType(StringType),
            selector: "==",
            positional_count: 1,
            implementation: builtin_string_equals,
        },
        BuiltinSpec {
            name: "call_data.length",
            subject: SubjectGuard::IsType(CallDataType),
            selector: "length",
            positional_count: 0,
            implementation: builtin_call_data_length,
        },
        BuiltinSpec {
            name: "call_data[]",
            subject: SubjectGuard::IsType(CallDataType),
            selector: "[]",
            positional_count: 1,
            implementation: builtin_call_data_get,
        },
    ]
}

// Assembles a [builtin idx, return] body.
fn new_builtin_code_block(runtime: &mut Runtime, index: u64) -> Result<Value> {
    let shorts = [Opcode::Builtin as u16, index as u16, Opcode::Return as u16];
    let mut bytes = Vec::with_capacity(shorts.len() * 2);
    for short in shorts.iter() {
        bytes.push((short & 0xFF) as u8);
        bytes.push((short >> 8) as u8);
    }
    let blob = object::new_heap_blob_with_data(runtime, &bytes)?;
    let empty = runtime.roots().empty_array;
    object::new_heap_code_block(runtime, blob, empty, 4)
}

// A [delegate, return] body for lambda and block calls; the high
// water mark leaves room for re-pushing the arguments.
fn new_delegate_code_block(runtime: &mut Runtime, opcode: Opcode) -> Result<Value> {
    let shorts = [opcode as u16, Opcode::Return as u16];
    let mut bytes = Vec::with_capacity(shorts.len() * 2);
    for short in shorts.iter() {
        bytes.push((short & 0xFF) as u8);
        bytes.push((short >> 8) as u8);
    }
    let blob = object::new_heap_blob_with_data(runtime, &bytes)?;
    let empty = runtime.roots().empty_array;
    object::new_heap_code_block(
        runtime,
        blob,
        empty,
        (method::MAX_LOOKUP_ARGUMENT_COUNT as u64) * 2,
    )
}

// Constructs the signature (subject, selector, 0 .. positional-1).
fn new_builtin_signature(
    runtime: &mut Runtime,
    subject_guard: Value,
    selector: Value,
    positional_count: u64,
    allow_extra: bool,
) -> Result<Value> {
    let subject_key = runtime.roots().subject_key;
    let selector_key = runtime.roots().selector_key;
    let selector_guard = method::new_heap_guard(runtime, method::GuardType::Eq, selector)?;
    let any_guard = runtime.roots().any_guard;
    let mut params = vec![
        (subject_key, subject_guard, false),
        (selector_key, selector_guard, false),
    ];
    for i in 0..positional_count {
        params.push((Value::new_integer(i as i64), any_guard, false));
    }
    method::new_heap_signature(runtime, &params, allow_extra)
}

// Populates the builtin methodspace and the named implementation map.
pub fn install_builtin_implementations(runtime: &mut Runtime) -> Result<()> {
    let space = runtime.roots().builtin_methodspace;
    let impls = runtime.roots().builtin_impls;
    for spec in builtin_specs() {
        let index = runtime.builtins.len() as u64;
        runtime.builtins.push(BuiltinImpl::Native(spec.implementation));
        let subject_guard = match spec.subject {
            SubjectGuard::IsType(root) => {
                let type_value = runtime.root(root);
                method::new_heap_guard(runtime, method::GuardType::Is, type_value)?
            }
            SubjectGuard::Any => runtime.roots().any_guard,
        };
        let selector_name = object::new_heap_utf8(runtime, spec.selector)?;
        let selector =
            object::new_heap_operation(runtime, object::OperationType::Infix, selector_name)?;
        let signature =
            new_builtin_signature(runtime, subject_guard, selector, spec.positional_count, false)?;
        let code = new_builtin_code_block(runtime, index)?;
        let method = method::new_heap_method(
            runtime,
            signature,
            nothing(),
            code,
            nothing(),
            enumflags2::BitFlags::empty(),
        )?;
        method::add_methodspace_method(runtime, space, method)?;
        let name = object::new_heap_utf8(runtime, spec.name)?;
        let implementation = object::new_heap_builtin_implementation(
            runtime,
            name,
            index,
            spec.positional_count,
            value::empty_flag_set(),
        )?;
        object::set_id_hash_map_at(runtime, impls, name, implementation)?;
    }
    // The delegate methods that make lambdas and blocks callable:
    // subject-typed, call-selector, any extra arguments welcome.
    install_delegate_method(
        runtime,
        crate::runtime::NamedRoot::LambdaType,
        Opcode::DelegateToLambda,
        method::MethodFlag::LambdaDelegate,
    )?;
    install_delegate_method(
        runtime,
        crate::runtime::NamedRoot::BlockType,
        Opcode::DelegateToBlock,
        method::MethodFlag::BlockDelegate,
    )?;
    Ok(())
}

fn install_delegate_method(
    runtime: &mut Runtime,
    subject_type: crate::runtime::NamedRoot,
    opcode: Opcode,
    flag: method::MethodFlag,
) -> Result<()> {
    let space = runtime.roots().builtin_methodspace;
    let type_value = runtime.root(subject_type);
    let subject_guard = method::new_heap_guard(runtime, method::GuardType::Is, type_value)?;
    let op_call = runtime.roots().op_call;
    let signature = new_builtin_signature(runtime, subject_guard, op_call, 0, true)?;
    let code = new_delegate_code_block(runtime, opcode)?;
    let method = method::new_heap_method(
        runtime,
        signature,
        nothing(),
        code,
        nothing(),
        flag.into(),
    )?;
    method::add_methodspace_method(runtime, space, method)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::syntax::{
        self, new_heap_ensure_ast, new_heap_escape_ast, new_heap_invocation_ast,
        new_heap_lambda_ast, new_heap_literal_ast, new_heap_local_declaration_ast,
        new_heap_method_ast, new_heap_block_ast, new_heap_parameter_ast, new_heap_sequence_ast,
        new_heap_signal_ast, new_heap_signal_handler_ast, new_heap_signature_ast,
        new_heap_symbol_ast, new_heap_variable_assignment_ast, new_heap_variable_load_ast,
    };

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    fn lit(runtime: &mut Runtime, value: Value) -> Value {
        new_heap_literal_ast(runtime, value).unwrap()
    }

    fn int_lit(runtime: &mut Runtime, value: i64) -> Value {
        lit(runtime, Value::new_integer(value))
    }

    fn infix(runtime: &mut Runtime, name: &str) -> Value {
        let name_value = object::new_heap_utf8(runtime, name).unwrap();
        object::new_heap_operation(runtime, object::OperationType::Infix, name_value).unwrap()
    }

    // An invocation of {subject, selector, 0: args...} in evaluation
    // order.
    fn call(runtime: &mut Runtime, subject: Value, selector: Value, args: &[Value]) -> Value {
        let subject_key = runtime.roots().subject_key;
        let selector_key = runtime.roots().selector_key;
        let arguments =
            object::new_heap_pair_array(runtime, 2 + args.len() as u64).unwrap();
        let selector_ast = lit(runtime, selector);
        object::set_pair_array_first_at(&mut runtime.heap, arguments, 0, subject_key);
        object::set_pair_array_second_at(&mut runtime.heap, arguments, 0, subject);
        object::set_pair_array_first_at(&mut runtime.heap, arguments, 1, selector_key);
        object::set_pair_array_second_at(&mut runtime.heap, arguments, 1, selector_ast);
        for (i, &argument) in args.iter().enumerate() {
            object::set_pair_array_first_at(
                &mut runtime.heap,
                arguments,
                2 + i as u64,
                Value::new_integer(i as i64),
            );
            object::set_pair_array_second_at(&mut runtime.heap, arguments, 2 + i as u64, argument);
        }
        new_heap_invocation_ast(runtime, arguments).unwrap()
    }

    fn binary_op(runtime: &mut Runtime, left: Value, name: &str, right: Value) -> Value {
        let selector = infix(runtime, name);
        call(runtime, left, selector, &[right])
    }

    fn sequence(runtime: &mut Runtime, nodes: &[Value]) -> Value {
        let values = object::new_heap_array_with_contents(runtime, nodes).unwrap();
        new_heap_sequence_ast(runtime, values).unwrap()
    }

    // A one-method lambda or block method: fn(params...) => body.
    fn method_ast(runtime: &mut Runtime, params: &[Value], body: Value) -> Value {
        let mut parameter_nodes = Vec::new();
        for (i, &symbol) in params.iter().enumerate() {
            let tags = object::new_heap_array_with_contents(
                runtime,
                &[Value::new_integer(i as i64)],
            )
            .unwrap();
            parameter_nodes.push(new_heap_parameter_ast(runtime, symbol, tags).unwrap());
        }
        let parameters =
            object::new_heap_array_with_contents(runtime, &parameter_nodes).unwrap();
        let signature = new_heap_signature_ast(runtime, parameters, false).unwrap();
        new_heap_method_ast(runtime, signature, body, nothing()).unwrap()
    }

    fn compile_ast(runtime: &mut Runtime, ast: Value) -> (Value, Value) {
        let fragment = syntax::new_program_fragment(runtime).unwrap();
        let code = syntax::compile_expression(runtime, ast, fragment).unwrap();
        (code, fragment)
    }

    fn run_ast(runtime: &mut Runtime, ast: Value) -> Result<Value> {
        let (code, fragment) = compile_ast(runtime, ast);
        trace!("{}", disassemble(&runtime.heap, code));
        execute_code_block(runtime, code, fragment)
    }

    #[test]
    fn test_integer_arithmetic() {
        let mut runtime = new_test_runtime();
        let one = int_lit(&mut runtime, 1);
        let two = int_lit(&mut runtime, 2);
        let ast = binary_op(&mut runtime, one, "+", two);
        let (code, fragment) = compile_ast(&mut runtime, ast);
        // The program compiles to pushes and an invocation.
        let listing = disassemble(&runtime.heap, code);
        assert!(listing.contains("push"));
        assert!(listing.contains("invoke"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 3);
    }

    #[test]
    fn test_arithmetic_builtins() {
        let mut runtime = new_test_runtime();
        for &(a, op, b, expected) in
            [(7i64, "-", 3i64, 4i64), (6, "*", 7, 42), (2, "+", -5, -3)].iter()
        {
            let left = int_lit(&mut runtime, a);
            let right = int_lit(&mut runtime, b);
            let ast = binary_op(&mut runtime, left, op, right);
            let result = run_ast(&mut runtime, ast).unwrap();
            assert_eq!(result.as_integer(), expected);
        }
        // Comparison yields booleans.
        let left = int_lit(&mut runtime, 2);
        let right = int_lit(&mut runtime, 3);
        let ast = binary_op(&mut runtime, left, "<", right);
        let result = run_ast(&mut runtime, ast).unwrap();
        assert!(result.is_same(value::yes()));
    }

    #[test]
    fn test_mutable_local() {
        // var x := 5; x := x + 1; x
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let one = int_lit(&mut runtime, 1);
        let sum = binary_op(&mut runtime, load_x, "+", one);
        let assign = new_heap_variable_assignment_ast(&mut runtime, x, sum).unwrap();
        let load_again = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let body = sequence(&mut runtime, &[assign, load_again]);
        let five = int_lit(&mut runtime, 5);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, true, five, body).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        // The variable lives in a reference cell: created at the
        // definition, written by the assignment, read by the loads.
        assert!(listing.contains("new-reference"));
        assert!(listing.contains("set-reference"));
        assert!(listing.contains("get-reference"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 6);
    }

    #[test]
    fn test_immutable_local() {
        // def x := 11 in x + x
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let load_a = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let load_b = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let body = binary_op(&mut runtime, load_a, "+", load_b);
        let eleven = int_lit(&mut runtime, 11);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, false, eleven, body).unwrap();
        let result = run_ast(&mut runtime, ast).unwrap();
        assert_eq!(result.as_integer(), 22);
    }

    #[test]
    fn test_escape() {
        // with_escape e do 1 + e(7) evaluates to 7, not 8.
        let mut runtime = new_test_runtime();
        let e = new_heap_symbol_ast(&mut runtime, "e").unwrap();
        let load_e = new_heap_variable_load_ast(&mut runtime, e).unwrap();
        let op_call = runtime.roots().op_call;
        let seven = int_lit(&mut runtime, 7);
        let fire = call(&mut runtime, load_e, op_call, &[seven]);
        let one = int_lit(&mut runtime, 1);
        let body = binary_op(&mut runtime, one, "+", fire);
        let ast = new_heap_escape_ast(&mut runtime, e, body).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        assert!(listing.contains("create-escape"));
        assert!(listing.contains("fire-escape-or-barrier"));
        assert!(listing.contains("dispose-escape"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 7);
    }

    #[test]
    fn test_escape_not_taken() {
        // with_escape e do 1 + 2: the escape dies undisturbed.
        let mut runtime = new_test_runtime();
        let e = new_heap_symbol_ast(&mut runtime, "e").unwrap();
        let one = int_lit(&mut runtime, 1);
        let two = int_lit(&mut runtime, 2);
        let body = binary_op(&mut runtime, one, "+", two);
        let ast = new_heap_escape_ast(&mut runtime, e, body).unwrap();
        let result = run_ast(&mut runtime, ast).unwrap();
        assert_eq!(result.as_integer(), 3);
    }

    #[test]
    fn test_ensure() {
        // var x := 0; (after { x := 1 } ensure { x := 2 }); x
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let one = int_lit(&mut runtime, 1);
        let body_assign = new_heap_variable_assignment_ast(&mut runtime, x, one).unwrap();
        let two = int_lit(&mut runtime, 2);
        let exit_assign = new_heap_variable_assignment_ast(&mut runtime, x, two).unwrap();
        let ensure = new_heap_ensure_ast(&mut runtime, body_assign, exit_assign).unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let body = sequence(&mut runtime, &[ensure, load_x]);
        let zero = int_lit(&mut runtime, 0);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, true, zero, body).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        // Body and cleanup live in separate code blocks; the normal
        // path calls then disposes the ensurer.
        assert!(listing.contains("create-ensurer"));
        assert!(listing.contains("call-ensurer"));
        assert!(listing.contains("dispose-ensurer"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 2);
    }

    #[test]
    fn test_ensure_runs_on_escape() {
        // with_escape e do (after { e(9) } ensure { x := 2 }); the
        // cleanup runs even though the body left by escape.
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let e = new_heap_symbol_ast(&mut runtime, "e").unwrap();
        let load_e = new_heap_variable_load_ast(&mut runtime, e).unwrap();
        let op_call = runtime.roots().op_call;
        let nine = int_lit(&mut runtime, 9);
        let fire = call(&mut runtime, load_e, op_call, &[nine]);
        let two = int_lit(&mut runtime, 2);
        let exit_assign = new_heap_variable_assignment_ast(&mut runtime, x, two).unwrap();
        let ensure = new_heap_ensure_ast(&mut runtime, fire, exit_assign).unwrap();
        let escape = new_heap_escape_ast(&mut runtime, e, ensure).unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let escape_then_x = sequence(&mut runtime, &[escape, load_x]);
        let zero = int_lit(&mut runtime, 0);
        let ast =
            new_heap_local_declaration_ast(&mut runtime, x, true, zero, escape_then_x).unwrap();
        let result = run_ast(&mut runtime, ast).unwrap();
        // The escape fired with 9 and the ensurer still assigned 2.
        assert_eq!(result.as_integer(), 2);
    }

    #[test]
    fn test_lambda_capture() {
        // def x := 10 in (fn y => x + y)(3) evaluates to 13.
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let y = new_heap_symbol_ast(&mut runtime, "y").unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let load_y = new_heap_variable_load_ast(&mut runtime, y).unwrap();
        let body = binary_op(&mut runtime, load_x, "+", load_y);
        let method = method_ast(&mut runtime, &[y], body);
        let methods = object::new_heap_array_with_contents(&mut runtime, &[method]).unwrap();
        let lambda = new_heap_lambda_ast(&mut runtime, methods).unwrap();
        let op_call = runtime.roots().op_call;
        let three = int_lit(&mut runtime, 3);
        let invocation = call(&mut runtime, lambda, op_call, &[three]);
        let ten = int_lit(&mut runtime, 10);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, false, ten, invocation).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        // One capture loaded before the lambda op.
        assert!(listing.contains("lambda"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 13);
    }

    #[test]
    fn test_lambda_two_arguments() {
        let mut runtime = new_test_runtime();
        let a = new_heap_symbol_ast(&mut runtime, "a").unwrap();
        let b = new_heap_symbol_ast(&mut runtime, "b").unwrap();
        let load_a = new_heap_variable_load_ast(&mut runtime, a).unwrap();
        let load_b = new_heap_variable_load_ast(&mut runtime, b).unwrap();
        let body = binary_op(&mut runtime, load_a, "*", load_b);
        let method = method_ast(&mut runtime, &[a, b], body);
        let methods = object::new_heap_array_with_contents(&mut runtime, &[method]).unwrap();
        let lambda = new_heap_lambda_ast(&mut runtime, methods).unwrap();
        let op_call = runtime.roots().op_call;
        let six = int_lit(&mut runtime, 6);
        let seven = int_lit(&mut runtime, 7);
        let ast = call(&mut runtime, lambda, op_call, &[six, seven]);
        let result = run_ast(&mut runtime, ast).unwrap();
        assert_eq!(result.as_integer(), 42);
    }

    #[test]
    fn test_block_refraction() {
        // def x := 42 in (bk b => x in b()) reads x through the
        // block's frame, not a copy.
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let b = new_heap_symbol_ast(&mut runtime, "b").unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let method = method_ast(&mut runtime, &[], load_x);
        let methods = object::new_heap_array_with_contents(&mut runtime, &[method]).unwrap();
        let load_b = new_heap_variable_load_ast(&mut runtime, b).unwrap();
        let op_call = runtime.roots().op_call;
        let invoke_b = call(&mut runtime, load_b, op_call, &[]);
        let block = new_heap_block_ast(&mut runtime, b, methods, invoke_b).unwrap();
        let forty_two = int_lit(&mut runtime, 42);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, false, forty_two, block).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        assert!(listing.contains("create-block"));
        assert!(listing.contains("dispose-block"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 42);
    }

    #[test]
    fn test_signal_handler() {
        // The handler's answer arrives at the installing frame.
        let mut runtime = new_test_runtime();
        let boom = infix(&mut runtime, "boom");
        let v = new_heap_symbol_ast(&mut runtime, "v").unwrap();
        let load_v = new_heap_variable_load_ast(&mut runtime, v).unwrap();
        let one = int_lit(&mut runtime, 1);
        let handler_body = binary_op(&mut runtime, load_v, "+", one);
        let handler = {
            let tags = object::new_heap_array_with_contents(&mut runtime, &[Value::new_integer(0)])
                .unwrap();
            let parameter = new_heap_parameter_ast(&mut runtime, v, tags).unwrap();
            let parameters =
                object::new_heap_array_with_contents(&mut runtime, &[parameter]).unwrap();
            let signature = new_heap_signature_ast(&mut runtime, parameters, false).unwrap();
            new_heap_method_ast(&mut runtime, signature, handler_body, boom).unwrap()
        };
        let handlers = object::new_heap_array_with_contents(&mut runtime, &[handler]).unwrap();
        let five = int_lit(&mut runtime, 5);
        let arguments = object::new_heap_array_with_contents(&mut runtime, &[five]).unwrap();
        let raise = new_heap_signal_ast(&mut runtime, true, boom, arguments).unwrap();
        let ast = new_heap_signal_handler_ast(&mut runtime, raise, handlers).unwrap();

        let (code, fragment) = compile_ast(&mut runtime, ast);
        let listing = disassemble(&runtime.heap, code);
        assert!(listing.contains("install-signal-handler"));
        assert!(listing.contains("signal-escape"));
        let result = execute_code_block(&mut runtime, code, fragment).unwrap();
        assert_eq!(result.as_integer(), 6);
    }

    #[test]
    fn test_uncaught_signal_aborts() {
        let mut runtime = new_test_runtime();
        let boom = infix(&mut runtime, "boom");
        let arguments = object::new_heap_array(&mut runtime, 0).unwrap();
        let raise = new_heap_signal_ast(&mut runtime, true, boom, arguments).unwrap();
        let err = run_ast(&mut runtime, raise).unwrap_err();
        assert_eq!(err.cause(), Cause::UncaughtSignal);
        // The escape detail bit is set.
        assert_eq!(err.details(), 1);
    }

    #[test]
    fn test_continuing_signal_falls_through() {
        let mut runtime = new_test_runtime();
        let boom = infix(&mut runtime, "boom");
        let arguments = object::new_heap_array(&mut runtime, 0).unwrap();
        let raise = new_heap_signal_ast(&mut runtime, false, boom, arguments).unwrap();
        let result = run_ast(&mut runtime, raise).unwrap();
        assert!(value::is_null(result));
    }

    #[test]
    fn test_dispatch_error_surfaces() {
        // No method matches strings and +.
        let mut runtime = new_test_runtime();
        let s = object::new_heap_utf8(&mut runtime, "not a number").unwrap();
        let left = lit(&mut runtime, s);
        let right = int_lit(&mut runtime, 1);
        let ast = binary_op(&mut runtime, left, "+", right);
        let err = run_ast(&mut runtime, ast).unwrap_err();
        assert_eq!(err.cause(), Cause::LookupError);
    }

    #[test]
    fn test_nested_calls_spill_pieces() {
        // A chain of lambda calls deep enough to cross stack pieces.
        let mut runtime = new_test_runtime();
        // f(n) = n + 1 applied repeatedly: ((1)+1)+1...
        let mut ast = int_lit(&mut runtime, 0);
        for _ in 0..40 {
            let n = new_heap_symbol_ast(&mut runtime, "n").unwrap();
            let load_n = new_heap_variable_load_ast(&mut runtime, n).unwrap();
            let one = int_lit(&mut runtime, 1);
            let body = binary_op(&mut runtime, load_n, "+", one);
            let method = method_ast(&mut runtime, &[n], body);
            let methods = object::new_heap_array_with_contents(&mut runtime, &[method]).unwrap();
            let lambda = new_heap_lambda_ast(&mut runtime, methods).unwrap();
            let op_call = runtime.roots().op_call;
            ast = call(&mut runtime, lambda, op_call, &[ast]);
        }
        let result = run_ast(&mut runtime, ast).unwrap();
        assert_eq!(result.as_integer(), 40);
    }

    #[test]
    fn test_execution_under_gc_pressure() {
        // Allocation fuzzing forces collections mid-execution; every
        // run must still come out right.
        let config = RuntimeConfig {
            gc_fuzz_freq: 16,
            gc_fuzz_seed: 77,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::new(&config).unwrap();
        for _ in 0..30 {
            // Building the test input isn't what's under pressure.
            runtime.heap.toggle_fuzzing(false);
            let one = int_lit(&mut runtime, 1);
            let two = int_lit(&mut runtime, 2);
            let ast = binary_op(&mut runtime, one, "+", two);
            let (code, fragment) = compile_ast(&mut runtime, ast);
            runtime.heap.toggle_fuzzing(true);
            let result = execute_code_block(&mut runtime, code, fragment).unwrap();
            assert_eq!(result.as_integer(), 3);
        }
    }

    #[test]
    fn test_captured_mutable_variable() {
        // var x := 1; (fn () => x := x + 10)(); x
        // The lambda captures the reference cell, so the write lands
        // in the original variable.
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let load_x = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let ten = int_lit(&mut runtime, 10);
        let sum = binary_op(&mut runtime, load_x, "+", ten);
        let assign = new_heap_variable_assignment_ast(&mut runtime, x, sum).unwrap();
        let method = method_ast(&mut runtime, &[], assign);
        let methods = object::new_heap_array_with_contents(&mut runtime, &[method]).unwrap();
        let lambda = new_heap_lambda_ast(&mut runtime, methods).unwrap();
        let op_call = runtime.roots().op_call;
        let invoke = call(&mut runtime, lambda, op_call, &[]);
        let load_after = new_heap_variable_load_ast(&mut runtime, x).unwrap();
        let body = sequence(&mut runtime, &[invoke, load_after]);
        let one = int_lit(&mut runtime, 1);
        let ast = new_heap_local_declaration_ast(&mut runtime, x, true, one, body).unwrap();
        let result = run_ast(&mut runtime, ast).unwrap();
        assert_eq!(result.as_integer(), 11);
    }
}
