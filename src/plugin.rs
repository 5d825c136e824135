// Native service plugins.
//
// A service exposes a namespace name and a set of selector-keyed
// methods. Binding happens at initialization: each service gets its
// own type, species and instance, and each method becomes an entry in
// the builtin methodspace whose trampoline adapts the invocation ABI
// to a plain request callback. The request resolves a pending promise
// through fulfill; a callback that never fulfills leaves the promise
// itself as the call's result.

use crate::heap::SafeValue;
use crate::interp::{BuiltinArguments, BuiltinImpl, Opcode};
use crate::method;
use crate::object;
use crate::runtime::Runtime;
use crate::value::{Result, Value, nothing};


// The native side of a service method: inspect the request, fulfill
// it when an answer exists.
pub type ServiceCallback = fn(&mut Runtime, &mut ServiceRequest);

pub struct ServiceMethod {
    pub selector: &'static str,
    pub positional_count: u64,
    pub callback: ServiceCallback,
}

pub struct ServiceDescriptor {
    pub namespace: &'static str,
    pub methods: Vec<ServiceMethod>,
}

// One installed service: its namespace name and its instance, held
// through a tracker so collections keep both alive.
pub struct ServiceBinding {
    pub name: String,
    pub instance: SafeValue,
}

pub struct ServiceRequest {
    pub subject: Value,
    pub arguments: Vec<Value>,
    promise: Value,
}

impl ServiceRequest {
    pub fn argument(&self, index: usize) -> Value {
        self.arguments[index]
    }

    pub fn fulfill(&mut self, runtime: &mut Runtime, value: Value) {
        object::fulfill_promise(&mut runtime.heap, self.promise, value);
    }
}

// Adapts a builtin invocation into a service request and back.
pub fn invoke_service_callback(
    runtime: &mut Runtime,
    callback: ServiceCallback,
    args: &BuiltinArguments,
) -> Result<Value> {
    let promise = object::new_heap_pending_promise(runtime)?;
    let subject = args.subject(&runtime.heap);
    let argc = args.frame.argument_count(&runtime.heap);
    let mut arguments = Vec::new();
    // Parameters zero and one are the subject and selector.
    for i in 0..argc.saturating_sub(2) {
        arguments.push(args.argument(&runtime.heap, i));
    }
    let mut request = ServiceRequest { subject, arguments, promise };
    callback(runtime, &mut request);
    match object::get_promise_state(&runtime.heap, promise) {
        object::PromiseState::Fulfilled => Ok(object::get_promise_value(&runtime.heap, promise)),
        // Unresolved requests hand the pending promise to the caller.
        _ => Ok(promise),
    }
}

// Creates the heap presence of each service and wires its methods
// into the builtin methodspace.
pub fn install_services(
    runtime: &mut Runtime,
    descriptors: &[ServiceDescriptor],
) -> Result<()> {
    let mut factories = Vec::new();
    for descriptor in descriptors {
        let display_name = object::new_heap_utf8(runtime, descriptor.namespace)?;
        let service_type = object::new_heap_type(runtime, display_name)?;
        let species = object::new_heap_instance_species(
            runtime,
            service_type,
            nothing(),
            crate::behavior::Mode::Mutable,
        )?;
        factories.push(species);
        let instance = object::new_heap_instance(runtime, species)?;
        for service_method in &descriptor.methods {
            install_service_method(runtime, service_type, service_method)?;
        }
        let safe = runtime.protect_value(instance);
        runtime.services.push(ServiceBinding {
            name: descriptor.namespace.to_owned(),
            instance: safe,
        });
    }
    if !factories.is_empty() {
        let array = object::new_heap_array_with_contents(runtime, &factories)?;
        runtime.install_plugin_factories(array);
    }
    Ok(())
}

fn install_service_method(
    runtime: &mut Runtime,
    service_type: Value,
    service_method: &ServiceMethod,
) -> Result<()> {
    let index = runtime.builtins.len() as u64;
    runtime.builtins.push(BuiltinImpl::Service(service_method.callback));
    let space = runtime.roots().builtin_methodspace;
    let subject_guard = method::new_heap_guard(runtime, method::GuardType::Is, service_type)?;
    let selector_name = object::new_heap_utf8(runtime, service_method.selector)?;
    let selector =
        object::new_heap_operation(runtime, object::OperationType::Infix, selector_name)?;
    let subject_key = runtime.roots().subject_key;
    let selector_key = runtime.roots().selector_key;
    let selector_guard = method::new_heap_guard(runtime, method::GuardType::Eq, selector)?;
    let any_guard = runtime.roots().any_guard;
    let mut params = vec![
        (subject_key, subject_guard, false),
        (selector_key, selector_guard, false),
    ];
    for i in 0..service_method.positional_count {
        params.push((Value::new_integer(i as i64), any_guard, false));
    }
    let signature = method::new_heap_signature(runtime, &params, false)?;
    // The trampoline body is just the builtin call.
    let shorts = [Opcode::Builtin as u16, index as u16, Opcode::Return as u16];
    let mut bytes = Vec::with_capacity(shorts.len() * 2);
    for short in shorts.iter() {
        bytes.push((short & 0xFF) as u8);
        bytes.push((short >> 8) as u8);
    }
    let blob = object::new_heap_blob_with_data(runtime, &bytes)?;
    let empty = runtime.roots().empty_array;
    let code = object::new_heap_code_block(runtime, blob, empty, 4)?;
    let method = method::new_heap_method(
        runtime,
        signature,
        nothing(),
        code,
        nothing(),
        enumflags2::BitFlags::empty(),
    )?;
    method::add_methodspace_method(runtime, space, method)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::clock::{NativeClock, NativeFileSystem};

    fn echo_service(_runtime: &mut Runtime, _request: &mut ServiceRequest) {
        // Deliberately leaves the promise pending.
    }

    fn add_service(runtime: &mut Runtime, request: &mut ServiceRequest) {
        let a = request.argument(0).as_integer();
        let b = request.argument(1).as_integer();
        request.fulfill(runtime, Value::new_integer(a + b));
    }

    fn test_descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            namespace: "calc",
            methods: vec![
                ServiceMethod { selector: "add", positional_count: 2, callback: add_service },
                ServiceMethod { selector: "echo", positional_count: 0, callback: echo_service },
            ],
        }
    }

    #[test]
    fn test_service_installation() {
        let config = RuntimeConfig::default();
        let runtime = Runtime::with_collaborators(
            &config,
            Box::new(NativeFileSystem),
            Box::new(NativeClock),
            &[test_descriptor()],
        )
        .unwrap();
        assert_eq!(runtime.services.len(), 1);
        assert_eq!(runtime.services[0].name, "calc");
        let instance = runtime.heap.deref(runtime.services[0].instance);
        assert!(instance.is_heap_object());
        // The factories root records the service species.
        let factories = runtime.roots().plugin_factories;
        assert_eq!(object::get_array_length(&runtime.heap, factories), 1);
    }
}
