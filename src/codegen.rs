// Bytecode assembly.
//
// The assembler owns a growing code buffer, a pool of constants
// deduplicated by identity, a running stack height with its high
// water mark, and a scope chain for resolving symbols.
//
// A word on the terminology used about bindings:
//
//  - An _outer_ binding is one defined in an enclosing frame.
//  - A _captured_ binding is an outer binding that a lambda has
//    copied into the heap, so it survives the originating scope.
//  - A _refracted_ binding is an outer binding a block reads from its
//    original stack location, which is guaranteed to still be there
//    when the block runs.
//
// The two combine: a refracted binding can be captured by an inner
// lambda and a captured binding can be refracted through an inner
// block. Lambda scopes rewrite traversed bindings into captures;
// block scopes pass bindings through with one more level of depth.

use crate::behavior;
use crate::interp::Opcode;
use crate::object;
use crate::runtime::Runtime;
use crate::value::{Condition, Result, SyntaxError, Value};


// Identifies what kind of binding a bound symbol represents. The
// encoding must fit a tagged integer together with the data and depth
// fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingType {
    // A local variable slot in the current frame.
    Local = 0,
    // An argument of the current immediate function.
    Argument = 1,
    // A symbol captured by an enclosing method.
    LambdaCaptured = 2,
    // A local holding a mutable variable's reference cell.
    MutableLocal = 3,
    // A capture that holds a reference cell, not the value.
    MutableCaptured = 4,
    // A local holding a live escape section.
    Escape = 5,
}

impl BindingType {
    fn from_i64(raw: i64) -> BindingType {
        match raw {
            0 => BindingType::Local,
            1 => BindingType::Argument,
            2 => BindingType::LambdaCaptured,
            3 => BindingType::MutableLocal,
            4 => BindingType::MutableCaptured,
            5 => BindingType::Escape,
            _ => panic!("invalid binding type {}", raw),
        }
    }
}

// A binding: its type, 16 bits of data (a slot, parameter or capture
// index), and how many block layers lie between use and definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    pub binding_type: BindingType,
    pub data: u16,
    pub block_depth: u16,
}

impl BindingInfo {
    pub fn new(binding_type: BindingType, data: u16) -> BindingInfo {
        BindingInfo { binding_type, data, block_depth: 0 }
    }

    // Bindings are stored in scope maps as tagged integers.
    pub fn encode(self) -> Value {
        let raw = ((self.binding_type as i64) << 32)
            | ((self.data as i64) << 16)
            | self.block_depth as i64;
        Value::new_integer(raw)
    }

    pub fn decode(value: Value) -> BindingInfo {
        let raw = value.as_integer();
        BindingInfo {
            binding_type: BindingType::from_i64(raw >> 32),
            data: ((raw >> 16) & 0xFFFF) as u16,
            block_depth: (raw & 0xFFFF) as u16,
        }
    }
}


// One link of the scope chain. The bottom of the chain always fails,
// which is what the empty chain amounts to.
enum ScopeEntry {
    SingleSymbol {
        symbol: Value,
        info: BindingInfo,
    },
    // Parameters and locals.
    Map {
        bindings: Vec<(Value, BindingInfo)>,
    },
    // Records symbols resolved through it as captures.
    LambdaCapture {
        captures: Vec<Value>,
    },
    // Pure refractor: passes bindings through one block level deeper.
    BlockRefractor,
}

fn scope_local_hit(entry: &ScopeEntry, symbol: Value) -> Option<BindingInfo> {
    match entry {
        ScopeEntry::SingleSymbol { symbol: bound, info } => {
            if bound.is_same(symbol) {
                Some(*info)
            } else {
                None
            }
        }
        ScopeEntry::Map { bindings } => bindings
            .iter()
            .find(|(bound, _)| bound.is_same(symbol))
            .map(|(_, info)| *info),
        _ => None,
    }
}


// A position in the code buffer whose operand gets patched once the
// target is known.
#[derive(Copy, Clone, Debug)]
pub struct PatchCursor(usize);

// The buffers of an enclosing code block, parked while a nested one
// compiles.
pub struct SavedCode {
    code: Vec<u16>,
    pool: Vec<Value>,
    stack_height: u64,
    high_water_mark: u64,
}


pub struct Assembler {
    code: Vec<u16>,
    pool: Vec<Value>,
    stack_height: u64,
    high_water_mark: u64,
    scopes: Vec<ScopeEntry>,
    // The module fragment being compiled within.
    pub fragment: Value,
}

// Whether every emitted opcode is followed by a stack height check.
const EXPENSIVE_CHECKS: bool = cfg!(debug_assertions);

impl Assembler {
    pub fn new(fragment: Value) -> Assembler {
        Assembler {
            code: Vec::new(),
            pool: Vec::new(),
            stack_height: 0,
            high_water_mark: 0,
            scopes: Vec::new(),
            fragment,
        }
    }

    // --- C o d e   b u f f e r ---

    pub fn code_cursor(&self) -> u64 {
        self.code.len() as u64
    }

    fn emit(&mut self, opcode: Opcode, operands: &[u16], delta: i64) {
        self.code.push(opcode as u16);
        self.code.extend_from_slice(operands);
        self.adjust_stack_height(delta);
        if EXPENSIVE_CHECKS && opcode != Opcode::Goto && opcode != Opcode::Return {
            self.code.push(Opcode::CheckStackHeight as u16);
            self.code.push(self.stack_height as u16);
        }
    }

    pub fn adjust_stack_height(&mut self, delta: i64) {
        let height = self.stack_height as i64 + delta;
        debug_assert!(height >= 0, "stack underflow in assembler");
        self.stack_height = height as u64;
        if self.stack_height > self.high_water_mark {
            self.high_water_mark = self.stack_height;
        }
    }

    // Accounts for slots used transiently above the tracked height.
    fn note_transient_slots(&mut self, count: u64) {
        if self.stack_height + count > self.high_water_mark {
            self.high_water_mark = self.stack_height + count;
        }
    }

    pub fn stack_height(&self) -> u64 {
        self.stack_height
    }

    // --- V a l u e   p o o l ---

    // Interns a constant, reusing the slot of a structurally
    // identical one.
    pub fn pool_index(&mut self, heap: &crate::heap::Heap, value: Value) -> u16 {
        for (index, &existing) in self.pool.iter().enumerate() {
            match behavior::value_identity_compare(heap, existing, value) {
                Ok(true) => return index as u16,
                _ => {}
            }
        }
        self.pool.push(value);
        (self.pool.len() - 1) as u16
    }

    // --- S c o p e s ---

    pub fn push_single_symbol_scope(&mut self, symbol: Value, info: BindingInfo) {
        self.scopes.push(ScopeEntry::SingleSymbol { symbol, info });
    }

    pub fn push_map_scope(&mut self) {
        self.scopes.push(ScopeEntry::Map { bindings: Vec::new() });
    }

    pub fn push_lambda_scope(&mut self) {
        self.scopes.push(ScopeEntry::LambdaCapture { captures: Vec::new() });
    }

    pub fn push_block_scope(&mut self) {
        self.scopes.push(ScopeEntry::BlockRefractor);
    }

    // Pops a lambda scope, returning the captured symbols in capture
    // order.
    pub fn pop_lambda_scope(&mut self) -> Vec<Value> {
        match self.scopes.pop() {
            Some(ScopeEntry::LambdaCapture { captures }) => captures,
            _ => panic!("popped scope is not a lambda scope"),
        }
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // Binds a symbol in the innermost map scope. The symbol must not
    // already be bound there.
    pub fn bind_symbol(&mut self, symbol: Value, info: BindingInfo) -> Result<()> {
        match self.scopes.last_mut() {
            Some(ScopeEntry::Map { bindings }) => {
                if bindings.iter().any(|(bound, _)| bound.is_same(symbol)) {
                    return Err(Condition::invalid_syntax(SyntaxError::SymbolAlreadyBound));
                }
                bindings.push((symbol, info));
                Ok(())
            }
            _ => panic!("binding without a map scope"),
        }
    }

    // Resolves a symbol through the chain. The definition is found
    // walking outward; walking back in, each traversed lambda scope
    // turns the binding into a capture and each traversed block scope
    // adds a level of refraction.
    pub fn lookup_symbol(&mut self, symbol: Value) -> Result<BindingInfo> {
        let mut found = None;
        for i in (0..self.scopes.len()).rev() {
            if let Some(info) = scope_local_hit(&self.scopes[i], symbol) {
                found = Some((i, info));
                break;
            }
        }
        let (def_index, mut info) = match found {
            Some(found) => found,
            None => return Err(Condition::invalid_syntax(SyntaxError::SymbolNotBound)),
        };
        for i in def_index + 1..self.scopes.len() {
            match &mut self.scopes[i] {
                ScopeEntry::LambdaCapture { captures } => {
                    let index = match captures.iter().position(|c| c.is_same(symbol)) {
                        Some(index) => index,
                        None => {
                            captures.push(symbol);
                            captures.len() - 1
                        }
                    };
                    // A mutable binding captures its reference cell,
                    // which the capture must keep saying.
                    let captured_type = match info.binding_type {
                        BindingType::MutableLocal | BindingType::MutableCaptured => {
                            BindingType::MutableCaptured
                        }
                        _ => BindingType::LambdaCaptured,
                    };
                    info = BindingInfo::new(captured_type, index as u16);
                }
                ScopeEntry::BlockRefractor => {
                    info.block_depth += 1;
                }
                _ => {}
            }
        }
        Ok(info)
    }

    pub fn is_symbol_bound(&mut self, symbol: Value) -> bool {
        self.lookup_symbol(symbol).is_ok()
    }

    // --- E m i t t e r s ---

    pub fn emit_push(&mut self, heap: &crate::heap::Heap, value: Value) {
        let index = self.pool_index(heap, value);
        self.emit(Opcode::Push, &[index], 1);
    }

    pub fn emit_pop(&mut self, count: u16) {
        self.emit(Opcode::Pop, &[count], -(count as i64));
    }

    // Pops the top, discards count values below it, pushes it back.
    pub fn emit_slap(&mut self, count: u16) {
        self.emit(Opcode::Slap, &[count], -(count as i64));
    }

    pub fn emit_new_array(&mut self, length: u16) {
        self.emit(Opcode::NewArray, &[length], 1 - length as i64);
    }

    pub fn emit_invocation(
        &mut self,
        heap: &crate::heap::Heap,
        tags: Value,
        fragment: Value,
        next_guards: Value,
        argc: u16,
    ) {
        let tags_index = self.pool_index(heap, tags);
        let fragment_index = self.pool_index(heap, fragment);
        let nexts_index = self.pool_index(heap, next_guards);
        self.emit(
            Opcode::Invoke,
            &[tags_index, fragment_index, nexts_index],
            1 - argc as i64,
        );
    }

    pub fn emit_signal(&mut self, heap: &crate::heap::Heap, escape: bool, tags: Value, argc: u16) {
        let tags_index = self.pool_index(heap, tags);
        let opcode = if escape { Opcode::SignalEscape } else { Opcode::SignalContinue };
        self.emit(opcode, &[tags_index], 1 - argc as i64);
    }

    pub fn emit_builtin(&mut self, index: u16) {
        self.emit(Opcode::Builtin, &[index], 1);
    }

    // A builtin that may raise rather than return.
    pub fn emit_builtin_maybe_escape(&mut self, index: u16, argc: u16) {
        self.emit(Opcode::BuiltinMaybeEscape, &[index, argc], 1);
    }

    pub fn emit_return(&mut self) {
        self.emit(Opcode::Return, &[], -1);
        // The height carries on for any code that follows a branch
        // around this return.
        self.adjust_stack_height(1);
    }

    pub fn emit_load_local(&mut self, index: u16) {
        self.emit(Opcode::LoadLocal, &[index], 1);
    }

    pub fn emit_load_refracted_local(&mut self, index: u16, block_depth: u16) {
        self.emit(Opcode::LoadRefractedLocal, &[index, block_depth], 1);
    }

    pub fn emit_load_argument(&mut self, param_index: u16) {
        self.emit(Opcode::LoadArgument, &[param_index], 1);
    }

    pub fn emit_load_refracted_argument(&mut self, param_index: u16, block_depth: u16) {
        self.emit(Opcode::LoadRefractedArgument, &[param_index, block_depth], 1);
    }

    pub fn emit_load_lambda_capture(&mut self, index: u16) {
        self.emit(Opcode::LoadLambdaCapture, &[index], 1);
    }

    pub fn emit_load_refracted_capture(&mut self, index: u16, block_depth: u16) {
        self.emit(Opcode::LoadRefractedCapture, &[index, block_depth], 1);
    }

    pub fn emit_load_global(&mut self, heap: &crate::heap::Heap, path: Value, fragment: Value) {
        let path_index = self.pool_index(heap, path);
        let fragment_index = self.pool_index(heap, fragment);
        self.emit(Opcode::LoadGlobal, &[path_index, fragment_index], 1);
    }

    pub fn emit_new_reference(&mut self) {
        self.emit(Opcode::NewReference, &[], 0);
    }

    pub fn emit_get_reference(&mut self) {
        self.emit(Opcode::GetReference, &[], 0);
    }

    pub fn emit_set_reference(&mut self) {
        self.emit(Opcode::SetReference, &[], -1);
    }

    pub fn emit_lambda(&mut self, heap: &crate::heap::Heap, methods: Value, capture_count: u16) {
        let methods_index = self.pool_index(heap, methods);
        self.emit(
            Opcode::Lambda,
            &[methods_index, capture_count],
            1 - capture_count as i64,
        );
    }

    pub fn emit_create_block(&mut self, heap: &crate::heap::Heap, methods: Value) {
        let methods_index = self.pool_index(heap, methods);
        let slots = crate::stack::barrier_size(crate::value::Genus::BlockSection) + 1;
        self.emit(Opcode::CreateBlock, &[methods_index], slots as i64);
    }

    pub fn emit_dispose_block(&mut self) {
        let slots = crate::stack::barrier_size(crate::value::Genus::BlockSection) + 1;
        self.emit(Opcode::DisposeBlock, &[], -(slots as i64));
    }

    // Returns the cursor where the escape's resumption offset must be
    // patched in.
    pub fn emit_create_escape(&mut self) -> PatchCursor {
        let slots = crate::stack::barrier_size(crate::value::Genus::EscapeSection) + 1;
        self.code.push(Opcode::CreateEscape as u16);
        let cursor = PatchCursor(self.code.len());
        self.code.push(0);
        self.adjust_stack_height(slots as i64);
        cursor
    }

    pub fn emit_dispose_escape(&mut self) {
        let slots = crate::stack::barrier_size(crate::value::Genus::EscapeSection) + 1;
        self.emit(Opcode::DisposeEscape, &[], -(slots as i64));
    }

    pub fn emit_fire_escape_or_barrier(&mut self) {
        self.emit(Opcode::FireEscapeOrBarrier, &[], -1);
    }

    pub fn emit_create_ensurer(&mut self, heap: &crate::heap::Heap, code_block: Value) {
        let code_index = self.pool_index(heap, code_block);
        let slots = crate::stack::barrier_size(crate::value::Genus::EnsureSection);
        self.emit(Opcode::CreateEnsurer, &[code_index], slots as i64);
    }

    pub fn emit_call_ensurer(&mut self) {
        // The cleanup's block argument briefly lives above the body
        // result.
        self.note_transient_slots(1);
        self.emit(Opcode::CallEnsurer, &[], 0);
    }

    pub fn emit_dispose_ensurer(&mut self) {
        let slots = crate::stack::barrier_size(crate::value::Genus::EnsureSection);
        self.emit(Opcode::DisposeEnsurer, &[], -(slots as i64));
    }

    // Returns the cursor for the continuation offset a signal leave
    // resumes at.
    pub fn emit_install_signal_handler(
        &mut self,
        heap: &crate::heap::Heap,
        methods: Value,
    ) -> PatchCursor {
        let methods_index = self.pool_index(heap, methods);
        let slots = crate::stack::barrier_size(crate::value::Genus::SignalHandlerSection);
        self.code.push(Opcode::InstallSignalHandler as u16);
        self.code.push(methods_index);
        let cursor = PatchCursor(self.code.len());
        self.code.push(0);
        self.adjust_stack_height(slots as i64);
        cursor
    }

    pub fn emit_uninstall_signal_handler(&mut self) {
        let slots = crate::stack::barrier_size(crate::value::Genus::SignalHandlerSection);
        self.emit(Opcode::UninstallSignalHandler, &[], -(slots as i64));
    }

    // Emits a forward jump to be patched later.
    pub fn emit_goto_forward(&mut self) -> PatchCursor {
        self.code.push(Opcode::Goto as u16);
        let cursor = PatchCursor(self.code.len());
        self.code.push(0);
        cursor
    }

    // Points a previously emitted cursor at the current position.
    pub fn patch_to_here(&mut self, cursor: PatchCursor) {
        self.code[cursor.0] = self.code.len() as u16;
    }

    pub fn emit_delegate_lambda_call(&mut self) {
        self.emit(Opcode::DelegateToLambda, &[], 1);
    }

    pub fn emit_delegate_block_call(&mut self) {
        self.emit(Opcode::DelegateToBlock, &[], 1);
    }

    pub fn emit_reify_arguments(&mut self, heap: &crate::heap::Heap, tags: Value) {
        let tags_index = self.pool_index(heap, tags);
        self.emit(Opcode::ReifyArguments, &[tags_index], 1);
    }

    // Packs the top argc (tag, value) pairs into a call data record.
    pub fn emit_create_call_data(&mut self, argc: u16) {
        self.emit(Opcode::CreateCallData, &[argc], 1 - 2 * argc as i64);
    }

    // --- N e s t e d   c o d e   b l o c k s ---

    // Method bodies compile into their own code blocks but share the
    // scope chain of the enclosing assembler, which is what lets
    // lambda captures and block refraction work. begin swaps in fresh
    // buffers; end flushes them and swaps the outer ones back.
    pub fn begin_code_block(&mut self) -> SavedCode {
        SavedCode {
            code: std::mem::replace(&mut self.code, Vec::new()),
            pool: std::mem::replace(&mut self.pool, Vec::new()),
            stack_height: std::mem::replace(&mut self.stack_height, 0),
            high_water_mark: std::mem::replace(&mut self.high_water_mark, 0),
        }
    }

    pub fn end_code_block(&mut self, runtime: &mut Runtime, saved: SavedCode) -> Result<Value> {
        let code = self.flush(runtime);
        self.restore_code_block(saved);
        code
    }

    pub fn abandon_code_block(&mut self, saved: SavedCode) {
        self.restore_code_block(saved);
    }

    fn restore_code_block(&mut self, saved: SavedCode) {
        self.code = saved.code;
        self.pool = saved.pool;
        self.stack_height = saved.stack_height;
        self.high_water_mark = saved.high_water_mark;
    }

    // --- F l u s h ---

    // Produces the finished code block: the bytecode blob, the pool
    // flushed to an array, and the high water mark with room for a
    // frame's bookkeeping slack.
    pub fn flush(&mut self, runtime: &mut Runtime) -> Result<Value> {
        let mut bytes = Vec::with_capacity(self.code.len() * 2);
        for &short in self.code.iter() {
            bytes.push((short & 0xFF) as u8);
            bytes.push((short >> 8) as u8);
        }
        let bytecode = object::new_heap_blob_with_data(runtime, &bytes)?;
        let pool = if self.pool.is_empty() {
            runtime.roots().empty_array
        } else {
            object::new_heap_array_with_contents(runtime, &self.pool)?
        };
        object::new_heap_code_block(runtime, bytecode, pool, self.high_water_mark + 2)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp;
    use crate::syntax::new_heap_symbol_ast;
    use crate::value::{self, Cause};

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    #[test]
    fn test_binding_round_trip() {
        for &(binding_type, data, depth) in [
            (BindingType::Local, 0u16, 0u16),
            (BindingType::Argument, 3, 0),
            (BindingType::LambdaCaptured, 65535, 2),
            (BindingType::MutableLocal, 7, 65535),
        ]
        .iter()
        {
            let info = BindingInfo { binding_type, data, block_depth: depth };
            let decoded = BindingInfo::decode(info.encode());
            assert_eq!(decoded, info);
            assert!(info.encode().is_integer());
        }
    }

    #[test]
    fn test_pool_interning() {
        let mut runtime = new_test_runtime();
        let mut assm = Assembler::new(value::nothing());
        let a = assm.pool_index(&runtime.heap, Value::new_integer(7));
        let b = assm.pool_index(&runtime.heap, Value::new_integer(8));
        let c = assm.pool_index(&runtime.heap, Value::new_integer(7));
        assert_eq!(a, c);
        assert_ne!(a, b);
        // Structurally identical strings share a slot.
        let s1 = object::new_heap_utf8(&mut runtime, "twice").unwrap();
        let s2 = object::new_heap_utf8(&mut runtime, "twice").unwrap();
        let i1 = assm.pool_index(&runtime.heap, s1);
        let i2 = assm.pool_index(&runtime.heap, s2);
        assert_eq!(i1, i2);
    }

    #[test]
    fn test_high_water_mark_tracks_pushes() {
        let mut runtime = new_test_runtime();
        let mut assm = Assembler::new(value::nothing());
        for i in 0..5 {
            assm.emit_push(&runtime.heap, Value::new_integer(i));
        }
        assert_eq!(assm.stack_height(), 5);
        assm.emit_pop(4);
        assert_eq!(assm.stack_height(), 1);
        assm.emit_return();
        let code = assm.flush(&mut runtime).unwrap();
        assert!(object::get_code_block_high_water_mark(&runtime.heap, code) >= 5);
        // The flushed pool holds the five distinct constants.
        let pool = object::get_code_block_value_pool(&runtime.heap, code);
        assert_eq!(object::get_array_length(&runtime.heap, pool), 5);
        let listing = interp::disassemble(&runtime.heap, code);
        assert!(listing.contains("push"));
        assert!(listing.contains("return"));
    }

    #[test]
    fn test_scope_chain_lookup() {
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let y = new_heap_symbol_ast(&mut runtime, "y").unwrap();
        let mut assm = Assembler::new(value::nothing());

        // The bottom always fails.
        let err = assm.lookup_symbol(x).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidSyntax);

        assm.push_map_scope();
        assm.bind_symbol(x, BindingInfo::new(BindingType::Local, 0)).unwrap();
        let info = assm.lookup_symbol(x).unwrap();
        assert_eq!(info.binding_type, BindingType::Local);
        assert_eq!(info.block_depth, 0);

        // Rebinding in the same scope is refused.
        let err = assm
            .bind_symbol(x, BindingInfo::new(BindingType::Local, 1))
            .unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidSyntax);

        // Inner scopes shadow outer ones.
        assm.push_single_symbol_scope(x, BindingInfo::new(BindingType::Argument, 2));
        let info = assm.lookup_symbol(x).unwrap();
        assert_eq!(info.binding_type, BindingType::Argument);
        assm.pop_scope();

        assert!(!assm.is_symbol_bound(y));
    }

    #[test]
    fn test_lambda_scope_records_captures() {
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let y = new_heap_symbol_ast(&mut runtime, "y").unwrap();
        let mut assm = Assembler::new(value::nothing());
        assm.push_map_scope();
        assm.bind_symbol(x, BindingInfo::new(BindingType::Local, 0)).unwrap();
        assm.bind_symbol(y, BindingInfo::new(BindingType::Local, 1)).unwrap();

        assm.push_lambda_scope();
        // Resolving through the lambda scope captures the symbol.
        let info = assm.lookup_symbol(x).unwrap();
        assert_eq!(info.binding_type, BindingType::LambdaCaptured);
        assert_eq!(info.data, 0);
        // The same symbol resolves to the same capture.
        let again = assm.lookup_symbol(x).unwrap();
        assert_eq!(again.data, 0);
        let other = assm.lookup_symbol(y).unwrap();
        assert_eq!(other.data, 1);
        let captures = assm.pop_lambda_scope();
        assert_eq!(captures.len(), 2);
        assert!(captures[0].is_same(x));
        assert!(captures[1].is_same(y));
    }

    #[test]
    fn test_block_scope_refracts() {
        let mut runtime = new_test_runtime();
        let x = new_heap_symbol_ast(&mut runtime, "x").unwrap();
        let mut assm = Assembler::new(value::nothing());
        assm.push_map_scope();
        assm.bind_symbol(x, BindingInfo::new(BindingType::Local, 3)).unwrap();
        assm.push_block_scope();
        assm.push_block_scope();
        let info = assm.lookup_symbol(x).unwrap();
        // The binding passes through unchanged, two levels deeper.
        assert_eq!(info.binding_type, BindingType::Local);
        assert_eq!(info.data, 3);
        assert_eq!(info.block_depth, 2);
    }
}
