// Processes and tasks.
//
// A process owns a work queue of pending jobs and a root task; a task
// ties a stack to its owning process. Work items are taken strictly
// in insertion order. Each process also carries its own pseudo-random
// state, seeded from the runtime stream, so identity hashes can be
// salted per process.

use crate::behavior::{self, Behavior};
use crate::heap::Heap;
use crate::object::{self, generic_validate};
use crate::runtime::Runtime;
use crate::stack;
use crate::value::{Result, Value, nothing};


pub const TASK_PROCESS_OFFSET: u64 = 1;
pub const TASK_STACK_OFFSET: u64 = 2;
pub const TASK_SIZE: u64 = 3;

pub fn get_task_process(heap: &Heap, task: Value) -> Value {
    heap.value_at(task.as_heap_object() + TASK_PROCESS_OFFSET)
}

pub fn get_task_stack(heap: &Heap, task: Value) -> Value {
    heap.value_at(task.as_heap_object() + TASK_STACK_OFFSET)
}

pub fn new_heap_task(runtime: &mut Runtime, process: Value) -> Result<Value> {
    let stack = stack::new_heap_stack(runtime, DEFAULT_STACK_PIECE_CAPACITY)?;
    let species = runtime.species_for(behavior::Family::Task, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(TASK_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + TASK_PROCESS_OFFSET, process);
    heap.set_value_at(result.as_heap_object() + TASK_STACK_OFFSET, stack);
    Ok(result)
}

pub const DEFAULT_STACK_PIECE_CAPACITY: u64 = 1024;

// A job is a (code block, data) pair.
pub const PROCESS_WORK_QUEUE_WIDTH: u64 = 2;

pub const PROCESS_WORK_QUEUE_OFFSET: u64 = 1;
pub const PROCESS_ROOT_TASK_OFFSET: u64 = 2;
pub const PROCESS_RANDOM_STATE_OFFSET: u64 = 3;
pub const PROCESS_SIZE: u64 = 4;

pub fn get_process_work_queue(heap: &Heap, process: Value) -> Value {
    heap.value_at(process.as_heap_object() + PROCESS_WORK_QUEUE_OFFSET)
}

pub fn get_process_root_task(heap: &Heap, process: Value) -> Value {
    heap.value_at(process.as_heap_object() + PROCESS_ROOT_TASK_OFFSET)
}

pub fn new_heap_process(runtime: &mut Runtime) -> Result<Value> {
    let work_queue =
        object::new_heap_fifo_buffer(runtime, PROCESS_WORK_QUEUE_WIDTH, 16)?;
    let seed = runtime.next_random();
    let species = runtime.species_for(behavior::Family::Process, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(PROCESS_SIZE, species)?;
    {
        let heap = &mut runtime.heap;
        let addr = result.as_heap_object();
        heap.set_value_at(addr + PROCESS_WORK_QUEUE_OFFSET, work_queue);
        heap.set_value_at(addr + PROCESS_ROOT_TASK_OFFSET, nothing());
        heap.set_value_at(
            addr + PROCESS_RANDOM_STATE_OFFSET,
            Value::new_integer((seed & 0x7FFF_FFFF_FFFF) as i64),
        );
    }
    let root_task = new_heap_task(runtime, result)?;
    runtime
        .heap
        .set_value_at(result.as_heap_object() + PROCESS_ROOT_TASK_OFFSET, root_task);
    Ok(result)
}

// Steps the process-local random stream.
pub fn next_process_random(heap: &mut Heap, process: Value) -> u64 {
    let addr = process.as_heap_object() + PROCESS_RANDOM_STATE_OFFSET;
    let mut state = heap.value_at(addr).as_integer() as u64;
    state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    heap.set_value_at(addr, Value::new_integer((state & 0x7FFF_FFFF_FFFF) as i64));
    state
}

pub fn offer_process_job(
    runtime: &mut Runtime,
    process: Value,
    code: Value,
    data: Value,
) -> Result<()> {
    let queue = get_process_work_queue(&runtime.heap, process);
    object::offer_to_fifo_buffer(runtime, queue, &[code, data])
}

// The oldest pending job, or NotFound when the queue is empty.
pub fn take_process_job(heap: &mut Heap, process: Value) -> Result<(Value, Value)> {
    let queue = get_process_work_queue(heap, process);
    let record = object::take_from_fifo_buffer(heap, queue)?;
    Ok((record[0], record[1]))
}


pub static TASK_BEHAVIOR: Behavior = Behavior::base(
    |_, _| behavior::ObjectLayout { size: TASK_SIZE, value_offset: 1 },
    generic_validate,
);

pub static PROCESS_BEHAVIOR: Behavior = Behavior::base(
    |_, _| behavior::ObjectLayout { size: PROCESS_SIZE, value_offset: 1 },
    generic_validate,
);


#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    #[test]
    fn test_process_owns_root_task() {
        let mut runtime = new_test_runtime();
        let process = new_heap_process(&mut runtime).unwrap();
        let task = get_process_root_task(&runtime.heap, process);
        assert!(get_task_process(&runtime.heap, task).is_same(process));
        let stack = get_task_stack(&runtime.heap, task);
        assert!(object::in_family(&runtime.heap, behavior::Family::Stack, stack));
    }

    #[test]
    fn test_work_queue_insertion_order() {
        let mut runtime = new_test_runtime();
        let process = new_heap_process(&mut runtime).unwrap();
        for i in 0..5 {
            offer_process_job(
                &mut runtime,
                process,
                Value::new_integer(i),
                Value::new_integer(i * 7),
            )
            .unwrap();
        }
        for i in 0..5 {
            let (code, data) = take_process_job(&mut runtime.heap, process).unwrap();
            assert_eq!(code.as_integer(), i);
            assert_eq!(data.as_integer(), i * 7);
        }
        assert!(take_process_job(&mut runtime.heap, process).is_err());
    }

    #[test]
    fn test_process_random_advances() {
        let mut runtime = new_test_runtime();
        let process = new_heap_process(&mut runtime).unwrap();
        let a = next_process_random(&mut runtime.heap, process);
        let b = next_process_random(&mut runtime.heap, process);
        assert_ne!(a, b);
    }
}
