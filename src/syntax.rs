// Syntax trees and the compiler.
//
// ASTs are ordinary heap objects; they arrive pre-built, usually by
// deserialization, and compile to code blocks in a single pass driven
// by the assembler's scope chain. There is no parser here and none is
// planned: source text is somebody else's problem.

use std::collections::HashMap;

use crate::behavior::{self, Behavior, Family};
use crate::codegen::{Assembler, BindingInfo, BindingType};
use crate::heap::Heap;
use crate::method;
use crate::object::{self, generic_validate};
use crate::runtime::Runtime;
use crate::value::{
    self, Condition, Result, SyntaxError, Value, is_nothing, nothing,
};


// --- N o d e   l a y o u t s ---

pub const SYMBOL_AST_NAME_OFFSET: u64 = 1;
pub const SYMBOL_AST_SIZE: u64 = 2;

pub const LITERAL_AST_VALUE_OFFSET: u64 = 1;
pub const LITERAL_AST_SIZE: u64 = 2;

pub const ARRAY_AST_ELEMENTS_OFFSET: u64 = 1;
pub const ARRAY_AST_SIZE: u64 = 2;

// Arguments are a pair array of (tag, node) in evaluation order.
pub const INVOCATION_AST_ARGUMENTS_OFFSET: u64 = 1;
pub const INVOCATION_AST_SIZE: u64 = 2;

pub const SEQUENCE_AST_VALUES_OFFSET: u64 = 1;
pub const SEQUENCE_AST_SIZE: u64 = 2;

pub const LOCAL_DECLARATION_AST_SYMBOL_OFFSET: u64 = 1;
pub const LOCAL_DECLARATION_AST_IS_MUTABLE_OFFSET: u64 = 2;
pub const LOCAL_DECLARATION_AST_VALUE_OFFSET: u64 = 3;
pub const LOCAL_DECLARATION_AST_BODY_OFFSET: u64 = 4;
pub const LOCAL_DECLARATION_AST_SIZE: u64 = 5;

pub const VARIABLE_LOAD_AST_SYMBOL_OFFSET: u64 = 1;
pub const VARIABLE_LOAD_AST_SIZE: u64 = 2;

pub const VARIABLE_ASSIGNMENT_AST_SYMBOL_OFFSET: u64 = 1;
pub const VARIABLE_ASSIGNMENT_AST_VALUE_OFFSET: u64 = 2;
pub const VARIABLE_ASSIGNMENT_AST_SIZE: u64 = 3;

pub const LAMBDA_AST_METHODS_OFFSET: u64 = 1;
pub const LAMBDA_AST_SIZE: u64 = 2;

pub const BLOCK_AST_SYMBOL_OFFSET: u64 = 1;
pub const BLOCK_AST_METHODS_OFFSET: u64 = 2;
pub const BLOCK_AST_BODY_OFFSET: u64 = 3;
pub const BLOCK_AST_SIZE: u64 = 4;

pub const ESCAPE_AST_SYMBOL_OFFSET: u64 = 1;
pub const ESCAPE_AST_BODY_OFFSET: u64 = 2;
pub const ESCAPE_AST_SIZE: u64 = 3;

pub const ENSURE_AST_BODY_OFFSET: u64 = 1;
pub const ENSURE_AST_ON_EXIT_OFFSET: u64 = 2;
pub const ENSURE_AST_SIZE: u64 = 3;

pub const SIGNAL_AST_IS_ESCAPE_OFFSET: u64 = 1;
pub const SIGNAL_AST_SELECTOR_OFFSET: u64 = 2;
pub const SIGNAL_AST_ARGUMENTS_OFFSET: u64 = 3;
pub const SIGNAL_AST_SIZE: u64 = 4;

pub const SIGNAL_HANDLER_AST_BODY_OFFSET: u64 = 1;
pub const SIGNAL_HANDLER_AST_HANDLERS_OFFSET: u64 = 2;
pub const SIGNAL_HANDLER_AST_SIZE: u64 = 3;

pub const PARAMETER_AST_SYMBOL_OFFSET: u64 = 1;
pub const PARAMETER_AST_TAGS_OFFSET: u64 = 2;
pub const PARAMETER_AST_SIZE: u64 = 3;

pub const SIGNATURE_AST_PARAMETERS_OFFSET: u64 = 1;
pub const SIGNATURE_AST_ALLOW_EXTRA_OFFSET: u64 = 2;
pub const SIGNATURE_AST_SIZE: u64 = 3;

pub const METHOD_AST_SIGNATURE_OFFSET: u64 = 1;
pub const METHOD_AST_BODY_OFFSET: u64 = 2;
pub const METHOD_AST_SELECTOR_OFFSET: u64 = 3;
pub const METHOD_AST_SIZE: u64 = 4;


// --- C o n s t r u c t o r s   a n d   a c c e s s o r s ---

macro_rules! ast_field {
    ($getter:ident, $offset:expr) => {
        pub fn $getter(heap: &Heap, node: Value) -> Value {
            heap.value_at(node.as_heap_object() + $offset)
        }
    };
}

fn new_ast_node(runtime: &mut Runtime, family: Family, size: u64) -> Result<Value> {
    let species = runtime.species_for(family, behavior::Mode::Mutable);
    runtime.alloc_heap_object(size, species)
}

ast_field!(get_symbol_ast_name, SYMBOL_AST_NAME_OFFSET);

pub fn new_heap_symbol_ast(runtime: &mut Runtime, name: &str) -> Result<Value> {
    let name_value = object::new_heap_utf8(runtime, name)?;
    let node = new_ast_node(runtime, Family::SymbolAst, SYMBOL_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + SYMBOL_AST_NAME_OFFSET, name_value);
    Ok(node)
}

ast_field!(get_literal_ast_value, LITERAL_AST_VALUE_OFFSET);

pub fn new_heap_literal_ast(runtime: &mut Runtime, value: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::LiteralAst, LITERAL_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + LITERAL_AST_VALUE_OFFSET, value);
    Ok(node)
}

ast_field!(get_array_ast_elements, ARRAY_AST_ELEMENTS_OFFSET);

pub fn new_heap_array_ast(runtime: &mut Runtime, elements: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::ArrayAst, ARRAY_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + ARRAY_AST_ELEMENTS_OFFSET, elements);
    Ok(node)
}

ast_field!(get_invocation_ast_arguments, INVOCATION_AST_ARGUMENTS_OFFSET);

pub fn new_heap_invocation_ast(runtime: &mut Runtime, arguments: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::InvocationAst, INVOCATION_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + INVOCATION_AST_ARGUMENTS_OFFSET, arguments);
    Ok(node)
}

ast_field!(get_sequence_ast_values, SEQUENCE_AST_VALUES_OFFSET);

pub fn new_heap_sequence_ast(runtime: &mut Runtime, values: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::SequenceAst, SEQUENCE_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + SEQUENCE_AST_VALUES_OFFSET, values);
    Ok(node)
}

ast_field!(get_local_declaration_ast_symbol, LOCAL_DECLARATION_AST_SYMBOL_OFFSET);
ast_field!(get_local_declaration_ast_value, LOCAL_DECLARATION_AST_VALUE_OFFSET);
ast_field!(get_local_declaration_ast_body, LOCAL_DECLARATION_AST_BODY_OFFSET);

pub fn is_local_declaration_mutable(heap: &Heap, node: Value) -> bool {
    value::get_boolean_value(
        heap.value_at(node.as_heap_object() + LOCAL_DECLARATION_AST_IS_MUTABLE_OFFSET),
    )
}

pub fn new_heap_local_declaration_ast(
    runtime: &mut Runtime,
    symbol: Value,
    is_mutable: bool,
    value: Value,
    body: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::LocalDeclarationAst, LOCAL_DECLARATION_AST_SIZE)?;
    let heap = &mut runtime.heap;
    let addr = node.as_heap_object();
    heap.set_value_at(addr + LOCAL_DECLARATION_AST_SYMBOL_OFFSET, symbol);
    heap.set_value_at(
        addr + LOCAL_DECLARATION_AST_IS_MUTABLE_OFFSET,
        value::new_boolean(is_mutable),
    );
    heap.set_value_at(addr + LOCAL_DECLARATION_AST_VALUE_OFFSET, value);
    heap.set_value_at(addr + LOCAL_DECLARATION_AST_BODY_OFFSET, body);
    Ok(node)
}

ast_field!(get_variable_load_ast_symbol, VARIABLE_LOAD_AST_SYMBOL_OFFSET);

pub fn new_heap_variable_load_ast(runtime: &mut Runtime, symbol: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::VariableLoadAst, VARIABLE_LOAD_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + VARIABLE_LOAD_AST_SYMBOL_OFFSET, symbol);
    Ok(node)
}

ast_field!(get_variable_assignment_ast_symbol, VARIABLE_ASSIGNMENT_AST_SYMBOL_OFFSET);
ast_field!(get_variable_assignment_ast_value, VARIABLE_ASSIGNMENT_AST_VALUE_OFFSET);

pub fn new_heap_variable_assignment_ast(
    runtime: &mut Runtime,
    symbol: Value,
    value: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::VariableAssignmentAst, VARIABLE_ASSIGNMENT_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + VARIABLE_ASSIGNMENT_AST_SYMBOL_OFFSET, symbol);
    heap.set_value_at(node.as_heap_object() + VARIABLE_ASSIGNMENT_AST_VALUE_OFFSET, value);
    Ok(node)
}

ast_field!(get_lambda_ast_methods, LAMBDA_AST_METHODS_OFFSET);

pub fn new_heap_lambda_ast(runtime: &mut Runtime, methods: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::LambdaAst, LAMBDA_AST_SIZE)?;
    runtime
        .heap
        .set_value_at(node.as_heap_object() + LAMBDA_AST_METHODS_OFFSET, methods);
    Ok(node)
}

ast_field!(get_block_ast_symbol, BLOCK_AST_SYMBOL_OFFSET);
ast_field!(get_block_ast_methods, BLOCK_AST_METHODS_OFFSET);
ast_field!(get_block_ast_body, BLOCK_AST_BODY_OFFSET);

pub fn new_heap_block_ast(
    runtime: &mut Runtime,
    symbol: Value,
    methods: Value,
    body: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::BlockAst, BLOCK_AST_SIZE)?;
    let heap = &mut runtime.heap;
    let addr = node.as_heap_object();
    heap.set_value_at(addr + BLOCK_AST_SYMBOL_OFFSET, symbol);
    heap.set_value_at(addr + BLOCK_AST_METHODS_OFFSET, methods);
    heap.set_value_at(addr + BLOCK_AST_BODY_OFFSET, body);
    Ok(node)
}

ast_field!(get_escape_ast_symbol, ESCAPE_AST_SYMBOL_OFFSET);
ast_field!(get_escape_ast_body, ESCAPE_AST_BODY_OFFSET);

pub fn new_heap_escape_ast(runtime: &mut Runtime, symbol: Value, body: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::EscapeAst, ESCAPE_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + ESCAPE_AST_SYMBOL_OFFSET, symbol);
    heap.set_value_at(node.as_heap_object() + ESCAPE_AST_BODY_OFFSET, body);
    Ok(node)
}

ast_field!(get_ensure_ast_body, ENSURE_AST_BODY_OFFSET);
ast_field!(get_ensure_ast_on_exit, ENSURE_AST_ON_EXIT_OFFSET);

pub fn new_heap_ensure_ast(runtime: &mut Runtime, body: Value, on_exit: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::EnsureAst, ENSURE_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + ENSURE_AST_BODY_OFFSET, body);
    heap.set_value_at(node.as_heap_object() + ENSURE_AST_ON_EXIT_OFFSET, on_exit);
    Ok(node)
}

ast_field!(get_signal_ast_selector, SIGNAL_AST_SELECTOR_OFFSET);
ast_field!(get_signal_ast_arguments, SIGNAL_AST_ARGUMENTS_OFFSET);

pub fn is_signal_ast_escape(heap: &Heap, node: Value) -> bool {
    value::get_boolean_value(heap.value_at(node.as_heap_object() + SIGNAL_AST_IS_ESCAPE_OFFSET))
}

pub fn new_heap_signal_ast(
    runtime: &mut Runtime,
    is_escape: bool,
    selector: Value,
    arguments: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::SignalAst, SIGNAL_AST_SIZE)?;
    let heap = &mut runtime.heap;
    let addr = node.as_heap_object();
    heap.set_value_at(addr + SIGNAL_AST_IS_ESCAPE_OFFSET, value::new_boolean(is_escape));
    heap.set_value_at(addr + SIGNAL_AST_SELECTOR_OFFSET, selector);
    heap.set_value_at(addr + SIGNAL_AST_ARGUMENTS_OFFSET, arguments);
    Ok(node)
}

ast_field!(get_signal_handler_ast_body, SIGNAL_HANDLER_AST_BODY_OFFSET);
ast_field!(get_signal_handler_ast_handlers, SIGNAL_HANDLER_AST_HANDLERS_OFFSET);

pub fn new_heap_signal_handler_ast(
    runtime: &mut Runtime,
    body: Value,
    handlers: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::SignalHandlerAst, SIGNAL_HANDLER_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + SIGNAL_HANDLER_AST_BODY_OFFSET, body);
    heap.set_value_at(node.as_heap_object() + SIGNAL_HANDLER_AST_HANDLERS_OFFSET, handlers);
    Ok(node)
}

ast_field!(get_parameter_ast_symbol, PARAMETER_AST_SYMBOL_OFFSET);
ast_field!(get_parameter_ast_tags, PARAMETER_AST_TAGS_OFFSET);

pub fn new_heap_parameter_ast(runtime: &mut Runtime, symbol: Value, tags: Value) -> Result<Value> {
    let node = new_ast_node(runtime, Family::ParameterAst, PARAMETER_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + PARAMETER_AST_SYMBOL_OFFSET, symbol);
    heap.set_value_at(node.as_heap_object() + PARAMETER_AST_TAGS_OFFSET, tags);
    Ok(node)
}

ast_field!(get_signature_ast_parameters, SIGNATURE_AST_PARAMETERS_OFFSET);

pub fn is_signature_ast_allow_extra(heap: &Heap, node: Value) -> bool {
    value::get_boolean_value(heap.value_at(node.as_heap_object() + SIGNATURE_AST_ALLOW_EXTRA_OFFSET))
}

pub fn new_heap_signature_ast(
    runtime: &mut Runtime,
    parameters: Value,
    allow_extra: bool,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::SignatureAst, SIGNATURE_AST_SIZE)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(node.as_heap_object() + SIGNATURE_AST_PARAMETERS_OFFSET, parameters);
    heap.set_value_at(
        node.as_heap_object() + SIGNATURE_AST_ALLOW_EXTRA_OFFSET,
        value::new_boolean(allow_extra),
    );
    Ok(node)
}

ast_field!(get_method_ast_signature, METHOD_AST_SIGNATURE_OFFSET);
ast_field!(get_method_ast_body, METHOD_AST_BODY_OFFSET);
ast_field!(get_method_ast_selector, METHOD_AST_SELECTOR_OFFSET);

pub fn new_heap_method_ast(
    runtime: &mut Runtime,
    signature: Value,
    body: Value,
    selector: Value,
) -> Result<Value> {
    let node = new_ast_node(runtime, Family::MethodAst, METHOD_AST_SIZE)?;
    let heap = &mut runtime.heap;
    let addr = node.as_heap_object();
    heap.set_value_at(addr + METHOD_AST_SIGNATURE_OFFSET, signature);
    heap.set_value_at(addr + METHOD_AST_BODY_OFFSET, body);
    heap.set_value_at(addr + METHOD_AST_SELECTOR_OFFSET, selector);
    Ok(node)
}


// --- C o m p i l a t i o n ---

// A fragment to compile and run standalone programs in: a namespace
// holding the installed service instances and a methodspace that
// chains to the builtins.
pub fn new_program_fragment(runtime: &mut Runtime) -> Result<Value> {
    let namespace = object::new_heap_namespace(runtime)?;
    let builtin_space = runtime.roots().builtin_methodspace;
    let methodspace = method::new_heap_methodspace(runtime, builtin_space)?;
    let services: Vec<(String, Value)> = runtime
        .services
        .iter()
        .map(|binding| (binding.name.clone(), runtime.heap.deref(binding.instance)))
        .collect();
    for (name, instance) in services {
        bind_in_namespace(runtime, namespace, &name, instance)?;
    }
    object::new_heap_module_fragment(runtime, value::present_stage(), namespace, methodspace)
}

// Adds a named binding to a namespace, as the module loader does when
// it populates fragments.
pub fn bind_in_namespace(
    runtime: &mut Runtime,
    namespace: Value,
    name: &str,
    value: Value,
) -> Result<()> {
    let key = object::new_heap_utf8(runtime, name)?;
    let bindings = object::get_namespace_bindings(&runtime.heap, namespace);
    object::set_id_hash_map_at(runtime, bindings, key, value)
}

// Compiles an expression into a code block ready to execute. On heap
// exhaustion the whole compilation restarts after a collection, so
// nothing in the assembler needs to survive one.
pub fn compile_expression(runtime: &mut Runtime, ast: Value, fragment: Value) -> Result<Value> {
    let s_ast = runtime.protect_value(ast);
    let s_fragment = runtime.protect_value(fragment);
    let result = runtime.retry_after_gc(|runtime| {
        let ast = runtime.heap.deref(s_ast);
        let fragment = runtime.heap.deref(s_fragment);
        let mut assm = Assembler::new(fragment);
        emit_expression(runtime, &mut assm, ast)?;
        assm.emit_return();
        assm.flush(runtime)
    });
    runtime.dispose_safe_value(s_fragment);
    runtime.dispose_safe_value(s_ast);
    result
}

fn emit_expression(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    match object::get_family(&runtime.heap, ast) {
        Family::LiteralAst => {
            let value = get_literal_ast_value(&runtime.heap, ast);
            assm.emit_push(&runtime.heap, value);
            Ok(())
        }
        Family::ArrayAst => {
            let elements = get_array_ast_elements(&runtime.heap, ast);
            let length = object::get_array_length(&runtime.heap, elements);
            for i in 0..length {
                let element = object::get_array_at(&runtime.heap, elements, i);
                emit_expression(runtime, assm, element)?;
            }
            assm.emit_new_array(length as u16);
            Ok(())
        }
        Family::SequenceAst => {
            let values = get_sequence_ast_values(&runtime.heap, ast);
            let length = object::get_array_length(&runtime.heap, values);
            if length == 0 {
                assm.emit_push(&runtime.heap, value::null());
                return Ok(());
            }
            for i in 0..length {
                let element = object::get_array_at(&runtime.heap, values, i);
                emit_expression(runtime, assm, element)?;
                if i + 1 < length {
                    assm.emit_pop(1);
                }
            }
            Ok(())
        }
        Family::LocalDeclarationAst => emit_local_declaration(runtime, assm, ast),
        Family::VariableLoadAst => emit_variable_load(runtime, assm, ast),
        Family::VariableAssignmentAst => emit_variable_assignment(runtime, assm, ast),
        Family::InvocationAst => emit_invocation(runtime, assm, ast),
        Family::LambdaAst => emit_lambda(runtime, assm, ast),
        Family::BlockAst => emit_block(runtime, assm, ast),
        Family::EscapeAst => emit_escape(runtime, assm, ast),
        Family::EnsureAst => emit_ensure(runtime, assm, ast),
        Family::SignalAst => emit_signal(runtime, assm, ast),
        Family::SignalHandlerAst => emit_signal_handler(runtime, assm, ast),
        _ => Err(Condition::invalid_syntax(SyntaxError::NotSyntax)),
    }
}

fn emit_local_declaration(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let symbol = get_local_declaration_ast_symbol(&runtime.heap, ast);
    let is_mutable = is_local_declaration_mutable(&runtime.heap, ast);
    let value = get_local_declaration_ast_value(&runtime.heap, ast);
    let body = get_local_declaration_ast_body(&runtime.heap, ast);
    emit_expression(runtime, assm, value)?;
    if is_mutable {
        assm.emit_new_reference();
    }
    let slot = (assm.stack_height() - 1) as u16;
    let binding_type = if is_mutable { BindingType::MutableLocal } else { BindingType::Local };
    assm.push_single_symbol_scope(symbol, BindingInfo::new(binding_type, slot));
    emit_expression(runtime, assm, body)?;
    assm.pop_scope();
    assm.emit_slap(1);
    Ok(())
}

// Emits the load of whatever a binding resolves to, leaving the raw
// slot contents on the stack.
fn emit_binding_load(assm: &mut Assembler, info: BindingInfo) {
    match info.binding_type {
        BindingType::Local | BindingType::MutableLocal | BindingType::Escape => {
            if info.block_depth == 0 {
                assm.emit_load_local(info.data);
            } else {
                assm.emit_load_refracted_local(info.data, info.block_depth);
            }
        }
        BindingType::Argument => {
            if info.block_depth == 0 {
                assm.emit_load_argument(info.data);
            } else {
                assm.emit_load_refracted_argument(info.data, info.block_depth);
            }
        }
        BindingType::LambdaCaptured | BindingType::MutableCaptured => {
            if info.block_depth == 0 {
                assm.emit_load_lambda_capture(info.data);
            } else {
                assm.emit_load_refracted_capture(info.data, info.block_depth);
            }
        }
    }
}

// Whether the slot holds a reference cell rather than the value.
fn binding_is_reference(info: BindingInfo) -> bool {
    match info.binding_type {
        BindingType::MutableLocal | BindingType::MutableCaptured => true,
        _ => false,
    }
}

fn emit_variable_load(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let symbol = get_variable_load_ast_symbol(&runtime.heap, ast);
    let info = assm.lookup_symbol(symbol)?;
    emit_binding_load(assm, info);
    if binding_is_reference(info) {
        assm.emit_get_reference();
    }
    Ok(())
}

fn emit_variable_assignment(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let symbol = get_variable_assignment_ast_symbol(&runtime.heap, ast);
    let value = get_variable_assignment_ast_value(&runtime.heap, ast);
    let info = assm.lookup_symbol(symbol)?;
    // Only variables boxed at declaration can be assigned; a capture
    // of one captures the box itself.
    if !binding_is_reference(info) {
        return Err(Condition::invalid_syntax(SyntaxError::SymbolNotBound));
    }
    emit_binding_load(assm, info);
    emit_expression(runtime, assm, value)?;
    assm.emit_set_reference();
    Ok(())
}

fn emit_invocation(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let arguments = get_invocation_ast_arguments(&runtime.heap, ast);
    let argc = object::get_pair_array_length(&runtime.heap, arguments);
    // A direct call of an escape-bound variable fires the escape
    // rather than dispatching.
    if argc > 0 {
        let subject_ast = object::get_pair_array_second_at(&runtime.heap, arguments, 0);
        if object::get_family(&runtime.heap, subject_ast) == Family::VariableLoadAst {
            let symbol = get_variable_load_ast_symbol(&runtime.heap, subject_ast);
            if let Ok(info) = assm.lookup_symbol(symbol) {
                if info.binding_type == BindingType::Escape {
                    if argc != 3 {
                        return Err(Condition::invalid_syntax(SyntaxError::Unspecified));
                    }
                    emit_binding_load(assm, info);
                    let value_ast = object::get_pair_array_second_at(&runtime.heap, arguments, 2);
                    emit_expression(runtime, assm, value_ast)?;
                    assm.emit_fire_escape_or_barrier();
                    return Ok(());
                }
            }
        }
    }
    let tag_array = object::new_heap_array(runtime, argc)?;
    for i in 0..argc {
        let tag = object::get_pair_array_first_at(&runtime.heap, arguments, i);
        object::set_array_at(&mut runtime.heap, tag_array, i, tag);
        let argument = object::get_pair_array_second_at(&runtime.heap, arguments, i);
        emit_expression(runtime, assm, argument)?;
    }
    let tags = method::new_heap_call_tags_from_evaluation_order(runtime, tag_array)?;
    let fragment = assm.fragment;
    assm.emit_invocation(&runtime.heap, tags, fragment, nothing(), argc as u16);
    Ok(())
}

// Builds the heap signature for a method: the subject, the selector
// under an eq guard, then the declared parameters under any guards.
fn build_method_signature(
    runtime: &mut Runtime,
    signature_ast: Value,
    selector: Value,
    with_subject: bool,
) -> Result<Value> {
    let any_guard = runtime.roots().any_guard;
    let subject_key = runtime.roots().subject_key;
    let selector_key = runtime.roots().selector_key;
    let selector_guard = method::new_heap_guard(runtime, method::GuardType::Eq, selector)?;
    let mut params = Vec::new();
    if with_subject {
        params.push((subject_key, any_guard, false));
    }
    params.push((selector_key, selector_guard, false));
    let parameters = get_signature_ast_parameters(&runtime.heap, signature_ast);
    let count = object::get_array_length(&runtime.heap, parameters);
    for i in 0..count {
        params.push((Value::new_integer(i as i64), any_guard, false));
    }
    let allow_extra = is_signature_ast_allow_extra(&runtime.heap, signature_ast);
    method::new_heap_signature(runtime, &params, allow_extra)
}

// Compiles one method body into its own code block, sharing the scope
// chain of the enclosing assembler. Parameters bind as arguments;
// param_base is the parameter index of the first declared parameter.
fn compile_method_body(
    runtime: &mut Runtime,
    assm: &mut Assembler,
    signature_ast: Value,
    body: Value,
    param_base: u16,
) -> Result<Value> {
    let saved = assm.begin_code_block();
    assm.push_map_scope();
    let parameters = get_signature_ast_parameters(&runtime.heap, signature_ast);
    let count = object::get_array_length(&runtime.heap, parameters);
    for i in 0..count {
        let parameter = object::get_array_at(&runtime.heap, parameters, i);
        let symbol = get_parameter_ast_symbol(&runtime.heap, parameter);
        assm.bind_symbol(
            symbol,
            BindingInfo::new(BindingType::Argument, param_base + i as u16),
        )?;
    }
    let result = emit_expression(runtime, assm, body);
    assm.pop_scope();
    match result {
        Ok(()) => {
            assm.emit_return();
            assm.end_code_block(runtime, saved)
        }
        Err(condition) => {
            assm.abandon_code_block(saved);
            Err(condition)
        }
    }
}

fn emit_lambda(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let space = method::new_heap_methodspace(runtime, nothing())?;
    let op_call = runtime.roots().op_call;
    assm.push_lambda_scope();
    let methods = get_lambda_ast_methods(&runtime.heap, ast);
    let count = object::get_array_length(&runtime.heap, methods);
    let mut result = Ok(());
    for i in 0..count {
        let method_ast = object::get_array_at(&runtime.heap, methods, i);
        let signature_ast = get_method_ast_signature(&runtime.heap, method_ast);
        let body = get_method_ast_body(&runtime.heap, method_ast);
        let selector = get_method_ast_selector(&runtime.heap, method_ast);
        let selector = if is_nothing(selector) { op_call } else { selector };
        result = (|| {
            let signature = build_method_signature(runtime, signature_ast, selector, true)?;
            let code = compile_method_body(runtime, assm, signature_ast, body, 2)?;
            let method = method::new_heap_method(
                runtime,
                signature,
                method_ast,
                code,
                assm.fragment,
                enumflags2::BitFlags::empty(),
            )?;
            method::add_methodspace_method(runtime, space, method)
        })();
        if result.is_err() {
            break;
        }
    }
    let captures = assm.pop_lambda_scope();
    result?;
    // The captured values are copied into the closure at creation, so
    // load them in capture order here in the enclosing scope.
    for &symbol in captures.iter() {
        let info = assm.lookup_symbol(symbol)?;
        emit_binding_load(assm, info);
    }
    assm.emit_lambda(&runtime.heap, space, captures.len() as u16);
    Ok(())
}

fn emit_block(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let space = method::new_heap_methodspace(runtime, nothing())?;
    let op_call = runtime.roots().op_call;
    let methods = get_block_ast_methods(&runtime.heap, ast);
    let count = object::get_array_length(&runtime.heap, methods);
    for i in 0..count {
        let method_ast = object::get_array_at(&runtime.heap, methods, i);
        let signature_ast = get_method_ast_signature(&runtime.heap, method_ast);
        let body = get_method_ast_body(&runtime.heap, method_ast);
        let selector = get_method_ast_selector(&runtime.heap, method_ast);
        let selector = if is_nothing(selector) { op_call } else { selector };
        // Block bodies read outer state through refraction, not
        // through captures.
        assm.push_block_scope();
        let compiled = (|| {
            let signature = build_method_signature(runtime, signature_ast, selector, true)?;
            let code = compile_method_body(runtime, assm, signature_ast, body, 2)?;
            let method = method::new_heap_method(
                runtime,
                signature,
                method_ast,
                code,
                assm.fragment,
                enumflags2::BitFlags::empty(),
            )?;
            method::add_methodspace_method(runtime, space, method)
        })();
        assm.pop_scope();
        compiled?;
    }
    assm.emit_create_block(&runtime.heap, space);
    let symbol = get_block_ast_symbol(&runtime.heap, ast);
    let slot = (assm.stack_height() - 1) as u16;
    assm.push_single_symbol_scope(symbol, BindingInfo::new(BindingType::Local, slot));
    let body = get_block_ast_body(&runtime.heap, ast);
    let result = emit_expression(runtime, assm, body);
    assm.pop_scope();
    result?;
    assm.emit_dispose_block();
    Ok(())
}

fn emit_escape(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let cursor = assm.emit_create_escape();
    let symbol = get_escape_ast_symbol(&runtime.heap, ast);
    let slot = (assm.stack_height() - 1) as u16;
    assm.push_single_symbol_scope(symbol, BindingInfo::new(BindingType::Escape, slot));
    let body = get_escape_ast_body(&runtime.heap, ast);
    let result = emit_expression(runtime, assm, body);
    assm.pop_scope();
    result?;
    assm.emit_dispose_escape();
    assm.patch_to_here(cursor);
    Ok(())
}

fn emit_ensure(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    // The cleanup compiles into its own code block; its reads of the
    // surrounding frame go through one level of refraction.
    let on_exit = get_ensure_ast_on_exit(&runtime.heap, ast);
    assm.push_block_scope();
    let saved = assm.begin_code_block();
    let compiled = emit_expression(runtime, assm, on_exit);
    let on_exit_code = match compiled {
        Ok(()) => {
            assm.emit_return();
            assm.end_code_block(runtime, saved)
        }
        Err(condition) => {
            assm.abandon_code_block(saved);
            Err(condition)
        }
    };
    assm.pop_scope();
    let on_exit_code = on_exit_code?;
    assm.emit_create_ensurer(&runtime.heap, on_exit_code);
    let body = get_ensure_ast_body(&runtime.heap, ast);
    emit_expression(runtime, assm, body)?;
    assm.emit_call_ensurer();
    assm.emit_dispose_ensurer();
    Ok(())
}

fn emit_signal(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let selector = get_signal_ast_selector(&runtime.heap, ast);
    let arguments = get_signal_ast_arguments(&runtime.heap, ast);
    let argc = object::get_array_length(&runtime.heap, arguments);
    let selector_key = runtime.roots().selector_key;
    // The raised invocation: the selector, then the positionals.
    let tag_array = object::new_heap_array(runtime, argc + 1)?;
    object::set_array_at(&mut runtime.heap, tag_array, 0, selector_key);
    for i in 0..argc {
        object::set_array_at(&mut runtime.heap, tag_array, i + 1, Value::new_integer(i as i64));
    }
    assm.emit_push(&runtime.heap, selector);
    for i in 0..argc {
        let argument = object::get_array_at(&runtime.heap, arguments, i);
        emit_expression(runtime, assm, argument)?;
    }
    let tags = method::new_heap_call_tags_from_evaluation_order(runtime, tag_array)?;
    let is_escape = is_signal_ast_escape(&runtime.heap, ast);
    assm.emit_signal(&runtime.heap, is_escape, tags, argc as u16 + 1);
    Ok(())
}

fn emit_signal_handler(runtime: &mut Runtime, assm: &mut Assembler, ast: Value) -> Result<()> {
    let space = method::new_heap_methodspace(runtime, nothing())?;
    let handlers = get_signal_handler_ast_handlers(&runtime.heap, ast);
    let count = object::get_array_length(&runtime.heap, handlers);
    for i in 0..count {
        let method_ast = object::get_array_at(&runtime.heap, handlers, i);
        let signature_ast = get_method_ast_signature(&runtime.heap, method_ast);
        let body = get_method_ast_body(&runtime.heap, method_ast);
        let selector = get_method_ast_selector(&runtime.heap, method_ast);
        // A raised signal has no subject, so the handler's first
        // declared parameter is parameter one.
        let signature = build_method_signature(runtime, signature_ast, selector, false)?;
        let code = compile_method_body(runtime, assm, signature_ast, body, 1)?;
        let method = method::new_heap_method(
            runtime,
            signature,
            method_ast,
            code,
            assm.fragment,
            enumflags2::BitFlags::empty(),
        )?;
        method::add_methodspace_method(runtime, space, method)?;
    }
    let cursor = assm.emit_install_signal_handler(&runtime.heap, space);
    let body = get_signal_handler_ast_body(&runtime.heap, ast);
    emit_expression(runtime, assm, body)?;
    assm.emit_uninstall_signal_handler();
    assm.patch_to_here(cursor);
    Ok(())
}


// --- P l a n k t o n   i m p o r t ---

// Turns a deserialized value into syntax. Nodes arrive as instances
// with a "type" field naming the node kind; symbols with the same
// name within one import unify into one symbol object.
pub fn ast_from_plankton(runtime: &mut Runtime, value: Value) -> Result<Value> {
    let mut symbols: HashMap<String, Value> = HashMap::new();
    import_node(runtime, value, &mut symbols)
}

fn instance_field(runtime: &mut Runtime, instance: Value, name: &str) -> Result<Value> {
    let key = object::new_heap_utf8(runtime, name)?;
    object::get_instance_field(&runtime.heap, instance, key)
        .map_err(|_| Condition::invalid_input_hint(&name[..name.len().min(4)]))
}

fn import_symbol(
    runtime: &mut Runtime,
    node: Value,
    symbols: &mut HashMap<String, Value>,
) -> Result<Value> {
    let name_value = instance_field(runtime, node, "name")?;
    let name = object::get_utf8_contents(&runtime.heap, name_value);
    if let Some(&existing) = symbols.get(&name) {
        return Ok(existing);
    }
    let symbol = new_heap_symbol_ast(runtime, &name)?;
    symbols.insert(name, symbol);
    Ok(symbol)
}

fn import_node_array(
    runtime: &mut Runtime,
    nodes: Value,
    symbols: &mut HashMap<String, Value>,
) -> Result<Value> {
    let length = object::get_array_length(&runtime.heap, nodes);
    let result = object::new_heap_array(runtime, length)?;
    for i in 0..length {
        let element = object::get_array_at(&runtime.heap, nodes, i);
        let imported = import_node(runtime, element, symbols)?;
        object::set_array_at(&mut runtime.heap, result, i, imported);
    }
    Ok(result)
}

fn import_node(
    runtime: &mut Runtime,
    node: Value,
    symbols: &mut HashMap<String, Value>,
) -> Result<Value> {
    if !object::in_family(&runtime.heap, Family::Instance, node) {
        // Bare values are literals of themselves.
        return new_heap_literal_ast(runtime, node);
    }
    let type_value = instance_field(runtime, node, "type")?;
    let type_name = object::get_utf8_contents(&runtime.heap, type_value);
    match type_name.as_str() {
        "symbol" => import_symbol(runtime, node, symbols),
        "literal" => {
            let value = instance_field(runtime, node, "value")?;
            new_heap_literal_ast(runtime, value)
        }
        "array" => {
            let elements = instance_field(runtime, node, "elements")?;
            let imported = import_node_array(runtime, elements, symbols)?;
            new_heap_array_ast(runtime, imported)
        }
        "sequence" => {
            let values = instance_field(runtime, node, "values")?;
            let imported = import_node_array(runtime, values, symbols)?;
            new_heap_sequence_ast(runtime, imported)
        }
        "local_declaration" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            let is_mutable_value = instance_field(runtime, node, "is_mutable")?;
            let value_node = instance_field(runtime, node, "value")?;
            let value = import_node(runtime, value_node, symbols)?;
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            let is_mutable = value::get_boolean_value(is_mutable_value);
            new_heap_local_declaration_ast(runtime, symbol, is_mutable, value, body)
        }
        "variable_load" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            new_heap_variable_load_ast(runtime, symbol)
        }
        "variable_assignment" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            let value_node = instance_field(runtime, node, "value")?;
            let value = import_node(runtime, value_node, symbols)?;
            new_heap_variable_assignment_ast(runtime, symbol, value)
        }
        "invocation" => {
            // Tags stay as plain values; arguments are nodes.
            let tags = instance_field(runtime, node, "tags")?;
            let values = instance_field(runtime, node, "values")?;
            let argc = object::get_array_length(&runtime.heap, tags);
            let arguments = object::new_heap_pair_array(runtime, argc)?;
            for i in 0..argc {
                let tag = object::get_array_at(&runtime.heap, tags, i);
                let tag = import_invocation_tag(runtime, tag)?;
                let argument_node = object::get_array_at(&runtime.heap, values, i);
                let argument = import_node(runtime, argument_node, symbols)?;
                object::set_pair_array_first_at(&mut runtime.heap, arguments, i, tag);
                object::set_pair_array_second_at(&mut runtime.heap, arguments, i, argument);
            }
            new_heap_invocation_ast(runtime, arguments)
        }
        "operation" => import_operation(runtime, node),
        "lambda" => {
            let methods = instance_field(runtime, node, "methods")?;
            let imported = import_node_array(runtime, methods, symbols)?;
            new_heap_lambda_ast(runtime, imported)
        }
        "block" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            let methods = instance_field(runtime, node, "methods")?;
            let imported = import_node_array(runtime, methods, symbols)?;
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            new_heap_block_ast(runtime, symbol, imported, body)
        }
        "escape" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            new_heap_escape_ast(runtime, symbol, body)
        }
        "ensure" => {
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            let on_exit_node = instance_field(runtime, node, "on_exit")?;
            let on_exit = import_node(runtime, on_exit_node, symbols)?;
            new_heap_ensure_ast(runtime, body, on_exit)
        }
        "signal" => {
            let is_escape = value::get_boolean_value(instance_field(runtime, node, "is_escape")?);
            let selector_node = instance_field(runtime, node, "selector")?;
            let selector = import_invocation_tag(runtime, selector_node)?;
            let arguments = instance_field(runtime, node, "arguments")?;
            let imported = import_node_array(runtime, arguments, symbols)?;
            new_heap_signal_ast(runtime, is_escape, selector, imported)
        }
        "signal_handler" => {
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            let handlers = instance_field(runtime, node, "handlers")?;
            let imported = import_node_array(runtime, handlers, symbols)?;
            new_heap_signal_handler_ast(runtime, body, imported)
        }
        "parameter" => {
            let symbol_node = instance_field(runtime, node, "symbol")?;
            let symbol = import_node(runtime, symbol_node, symbols)?;
            let tags = instance_field(runtime, node, "tags")?;
            new_heap_parameter_ast(runtime, symbol, tags)
        }
        "signature" => {
            let parameters = instance_field(runtime, node, "parameters")?;
            let imported = import_node_array(runtime, parameters, symbols)?;
            let allow_extra = value::get_boolean_value(instance_field(runtime, node, "allow_extra")?);
            new_heap_signature_ast(runtime, imported, allow_extra)
        }
        "method" => {
            let signature_node = instance_field(runtime, node, "signature")?;
            let signature = import_node(runtime, signature_node, symbols)?;
            let body_node = instance_field(runtime, node, "body")?;
            let body = import_node(runtime, body_node, symbols)?;
            let selector = match instance_field(runtime, node, "selector") {
                Ok(selector_node) => import_invocation_tag(runtime, selector_node)?,
                Err(_) => nothing(),
            };
            new_heap_method_ast(runtime, signature, body, selector)
        }
        _ => Err(Condition::invalid_syntax(SyntaxError::NotSyntax)),
    }
}

// A tag is a key marker string, an integer, or an operation instance.
fn import_invocation_tag(runtime: &mut Runtime, tag: Value) -> Result<Value> {
    if object::in_family(&runtime.heap, Family::Utf8, tag) {
        let name = object::get_utf8_contents(&runtime.heap, tag);
        return match name.as_str() {
            "subject" => Ok(runtime.roots().subject_key),
            "selector" => Ok(runtime.roots().selector_key),
            _ => Err(Condition::invalid_input_hint("tag")),
        };
    }
    if object::in_family(&runtime.heap, Family::Instance, tag) {
        return import_operation(runtime, tag);
    }
    Ok(tag)
}

fn import_operation(runtime: &mut Runtime, node: Value) -> Result<Value> {
    let op_type = instance_field(runtime, node, "operation")?;
    let op_type = object::OperationType::from_i64(op_type.as_integer());
    let op_value = instance_field(runtime, node, "value")?;
    object::new_heap_operation(runtime, op_type, op_value)
}


// --- B e h a v i o r   s t a t i c s ---

macro_rules! ast_behavior {
    ($name:ident, $size:expr) => {
        pub static $name: Behavior = Behavior::base(
            |_, _| behavior::ObjectLayout { size: $size, value_offset: 1 },
            generic_validate,
        )
        .modal();
    };
}

ast_behavior!(SYMBOL_AST_BEHAVIOR, SYMBOL_AST_SIZE);
ast_behavior!(LITERAL_AST_BEHAVIOR, LITERAL_AST_SIZE);
ast_behavior!(ARRAY_AST_BEHAVIOR, ARRAY_AST_SIZE);
ast_behavior!(INVOCATION_AST_BEHAVIOR, INVOCATION_AST_SIZE);
ast_behavior!(SEQUENCE_AST_BEHAVIOR, SEQUENCE_AST_SIZE);
ast_behavior!(LOCAL_DECLARATION_AST_BEHAVIOR, LOCAL_DECLARATION_AST_SIZE);
ast_behavior!(VARIABLE_LOAD_AST_BEHAVIOR, VARIABLE_LOAD_AST_SIZE);
ast_behavior!(VARIABLE_ASSIGNMENT_AST_BEHAVIOR, VARIABLE_ASSIGNMENT_AST_SIZE);
ast_behavior!(LAMBDA_AST_BEHAVIOR, LAMBDA_AST_SIZE);
ast_behavior!(BLOCK_AST_BEHAVIOR, BLOCK_AST_SIZE);
ast_behavior!(ESCAPE_AST_BEHAVIOR, ESCAPE_AST_SIZE);
ast_behavior!(ENSURE_AST_BEHAVIOR, ENSURE_AST_SIZE);
ast_behavior!(SIGNAL_AST_BEHAVIOR, SIGNAL_AST_SIZE);
ast_behavior!(SIGNAL_HANDLER_AST_BEHAVIOR, SIGNAL_HANDLER_AST_SIZE);
ast_behavior!(PARAMETER_AST_BEHAVIOR, PARAMETER_AST_SIZE);
ast_behavior!(SIGNATURE_AST_BEHAVIOR, SIGNATURE_AST_SIZE);
ast_behavior!(METHOD_AST_BEHAVIOR, METHOD_AST_SIZE);
