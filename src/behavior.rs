// Per-family behavior dispatch.
//
// Each species points to its family, and each family has exactly one
// Behavior record holding the operations the core needs over any heap
// object. Dispatch is one indirection: value -> species -> family ->
// behavior. The family list is fixed at build time; the families!
// macro below requires a behavior entry for every family, so leaving
// one out fails the build.

use crate::heap::Heap;
use crate::object;
use crate::runtime::Runtime;
use crate::value::{self, Condition, Domain, Phylum, Result, Value};


// How deep hashing and comparison recurse before assuming the object
// graph is circular.
pub const CIRCULAR_OBJECT_DEPTH_THRESHOLD: usize = 1024;


// The mode lattice. Transitions only ever go up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    Fluid = 0,
    Mutable = 1,
    Frozen = 2,
    DeepFrozen = 3,
}

impl Mode {
    pub fn from_i64(raw: i64) -> Mode {
        match raw {
            0 => Mode::Fluid,
            1 => Mode::Mutable,
            2 => Mode::Frozen,
            3 => Mode::DeepFrozen,
            _ => panic!("invalid mode {}", raw),
        }
    }
}

// Where an object's mode comes from: its species, or a rule fixed for
// the whole family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModeRule {
    FromSpecies,
    Fixed(Mode),
}


// Size and traceable range of an object, in words. Fields from
// value_offset up to size hold values the collector must visit; the
// header at offset zero is visited separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectLayout {
    pub size: u64,
    pub value_offset: u64,
}


// Accumulates field hashes into a single code. The mixing just has to
// be stable and spread bits; it isn't exposed.
pub struct HashStream {
    state: u64,
}

impl HashStream {
    pub fn new() -> HashStream {
        HashStream { state: 0x51_7C_C1_B7_27_22_0A_95 }
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut x = self.state ^ value.wrapping_mul(0x9E3779B97F4A7C15);
        x ^= x >> 29;
        x = x.wrapping_mul(0xBF58476D1CE4E5B9);
        x ^= x >> 32;
        self.state = x;
    }

    pub fn finish(&self) -> i64 {
        value::get_hash_code_value(value::new_hash_code(self.state))
    }
}


// Notices cycles while walking object graphs. Entering a value that
// is already on the path, or exceeding the depth threshold, yields a
// Circular condition; callers treat the values involved as unequal.
pub struct CycleDetector {
    entered: Vec<Value>,
}

impl CycleDetector {
    pub fn new() -> CycleDetector {
        CycleDetector { entered: Vec::new() }
    }

    pub fn enter(&mut self, value: Value) -> Result<()> {
        if self.entered.len() >= CIRCULAR_OBJECT_DEPTH_THRESHOLD {
            return Err(Condition::circular());
        }
        if self.entered.iter().any(|v| v.is_same(value)) {
            return Err(Condition::circular());
        }
        self.entered.push(value);
        Ok(())
    }

    pub fn leave(&mut self) {
        self.entered.pop();
    }
}


pub type LayoutFn = fn(&Heap, Value) -> ObjectLayout;
pub type ValidateFn = fn(&Heap, Value) -> Result<()>;
pub type HashFn = fn(&Heap, Value, &mut HashStream, &mut CycleDetector) -> Result<()>;
pub type CompareFn = fn(&Heap, Value, Value, &mut CycleDetector) -> Result<bool>;
pub type OrderingFn = fn(&Heap, Value, Value) -> Value;
pub type OwnedFreezeFn = fn(&mut Runtime, Value) -> Result<()>;
pub type FixupFn = fn(&mut Heap, Value, Value);
pub type FinalizeFn = fn(&mut Heap, Value);
pub type PrintFn = fn(&Heap, Value, &mut String);
pub type PrimaryTypeFn = fn(&Runtime, Value) -> Value;

pub struct Behavior {
    pub division: object::Division,
    pub mode_rule: ModeRule,
    pub layout: LayoutFn,
    pub validate: ValidateFn,
    // When None identity is pointer identity.
    pub transient_identity_hash: Option<HashFn>,
    pub identity_compare: Option<CompareFn>,
    pub ordering_compare: Option<OrderingFn>,
    pub ensure_owned_values_frozen: Option<OwnedFreezeFn>,
    pub post_migrate_fixup: Option<FixupFn>,
    pub finalize: Option<FinalizeFn>,
    pub print_on: Option<PrintFn>,
    // When None the family's type root is the primary type.
    pub get_primary_type: Option<PrimaryTypeFn>,
    // Freeze cheats opt out of having their fields checked during
    // deep-freeze validation.
    pub deep_frozen_field_validation: bool,
}

impl Behavior {
    pub const fn base(layout: LayoutFn, validate: ValidateFn) -> Behavior {
        Behavior {
            division: object::Division::Compact,
            mode_rule: ModeRule::Fixed(Mode::Mutable),
            layout,
            validate,
            transient_identity_hash: None,
            identity_compare: None,
            ordering_compare: None,
            ensure_owned_values_frozen: None,
            post_migrate_fixup: None,
            finalize: None,
            print_on: None,
            get_primary_type: None,
            deep_frozen_field_validation: true,
        }
    }

    pub const fn modal(mut self) -> Behavior {
        self.division = object::Division::Modal;
        self.mode_rule = ModeRule::FromSpecies;
        self
    }

    pub const fn instance_division(mut self) -> Behavior {
        self.division = object::Division::Instance;
        self.mode_rule = ModeRule::FromSpecies;
        self
    }

    pub const fn c_object_division(mut self) -> Behavior {
        self.division = object::Division::CObject;
        self.mode_rule = ModeRule::FromSpecies;
        self
    }

    pub const fn fixed_mode(mut self, mode: Mode) -> Behavior {
        self.mode_rule = ModeRule::Fixed(mode);
        self
    }

    pub const fn with_hash(mut self, hash: HashFn) -> Behavior {
        self.transient_identity_hash = Some(hash);
        self
    }

    pub const fn with_compare(mut self, compare: CompareFn) -> Behavior {
        self.identity_compare = Some(compare);
        self
    }

    pub const fn with_ordering(mut self, ordering: OrderingFn) -> Behavior {
        self.ordering_compare = Some(ordering);
        self
    }

    pub const fn with_owned_freeze(mut self, freeze: OwnedFreezeFn) -> Behavior {
        self.ensure_owned_values_frozen = Some(freeze);
        self
    }

    pub const fn with_fixup(mut self, fixup: FixupFn) -> Behavior {
        self.post_migrate_fixup = Some(fixup);
        self
    }

    pub const fn with_finalizer(mut self, finalize: FinalizeFn) -> Behavior {
        self.finalize = Some(finalize);
        self
    }

    pub const fn with_print(mut self, print: PrintFn) -> Behavior {
        self.print_on = Some(print);
        self
    }

    pub const fn with_primary_type(mut self, get: PrimaryTypeFn) -> Behavior {
        self.get_primary_type = Some(get);
        self
    }

    pub const fn no_deep_frozen_field_validation(mut self) -> Behavior {
        self.deep_frozen_field_validation = false;
        self
    }
}


macro_rules! families {
    ($($name:ident = $index:expr => $behavior:path,)*) => {
        // One of the fixed kinds of heap object.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum Family {
            $($name = $index,)*
        }

        pub const FAMILY_COUNT: usize = [$($index,)*].len();

        pub const ALL_FAMILIES: [Family; FAMILY_COUNT] = [$(Family::$name,)*];

        impl Family {
            pub fn from_u8(raw: u8) -> Family {
                match raw as i64 {
                    $($index => Family::$name,)*
                    _ => panic!("invalid family {}", raw),
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Family::$name => stringify!($name),)*
                }
            }
        }

        pub fn family_behavior(family: Family) -> &'static Behavior {
            match family {
                $(Family::$name => &$behavior,)*
            }
        }
    };
}

families! {
    Species = 0 => object::SPECIES_BEHAVIOR,
    Array = 1 => object::ARRAY_BEHAVIOR,
    ArrayBuffer = 2 => object::ARRAY_BUFFER_BEHAVIOR,
    IdHashMap = 3 => object::ID_HASH_MAP_BEHAVIOR,
    FifoBuffer = 4 => object::FIFO_BUFFER_BEHAVIOR,
    Blob = 5 => object::BLOB_BEHAVIOR,
    Utf8 = 6 => object::UTF8_BEHAVIOR,
    Instance = 7 => object::INSTANCE_BEHAVIOR,
    CObject = 8 => object::C_OBJECT_BEHAVIOR,
    Reference = 9 => object::REFERENCE_BEHAVIOR,
    FreezeCheat = 10 => object::FREEZE_CHEAT_BEHAVIOR,
    CodeBlock = 11 => object::CODE_BLOCK_BEHAVIOR,
    Type = 12 => object::TYPE_BEHAVIOR,
    Key = 13 => object::KEY_BEHAVIOR,
    Operation = 14 => object::OPERATION_BEHAVIOR,
    Path = 15 => object::PATH_BEHAVIOR,
    Guard = 16 => crate::method::GUARD_BEHAVIOR,
    Parameter = 17 => crate::method::PARAMETER_BEHAVIOR,
    Signature = 18 => crate::method::SIGNATURE_BEHAVIOR,
    SignatureMap = 19 => crate::method::SIGNATURE_MAP_BEHAVIOR,
    Method = 20 => crate::method::METHOD_BEHAVIOR,
    Methodspace = 21 => crate::method::METHODSPACE_BEHAVIOR,
    CallTags = 22 => crate::method::CALL_TAGS_BEHAVIOR,
    CallData = 23 => crate::method::CALL_DATA_BEHAVIOR,
    ArgumentMapTrie = 24 => crate::method::ARGUMENT_MAP_TRIE_BEHAVIOR,
    Lambda = 25 => object::LAMBDA_BEHAVIOR,
    Block = 26 => object::BLOCK_BEHAVIOR,
    Namespace = 27 => object::NAMESPACE_BEHAVIOR,
    ModuleFragment = 28 => object::MODULE_FRAGMENT_BEHAVIOR,
    Module = 29 => object::MODULE_BEHAVIOR,
    Library = 30 => object::LIBRARY_BEHAVIOR,
    BuiltinImplementation = 31 => object::BUILTIN_IMPLEMENTATION_BEHAVIOR,
    Stack = 32 => crate::stack::STACK_BEHAVIOR,
    StackPiece = 33 => crate::stack::STACK_PIECE_BEHAVIOR,
    Promise = 34 => object::PROMISE_BEHAVIOR,
    Task = 35 => crate::process::TASK_BEHAVIOR,
    Process = 36 => crate::process::PROCESS_BEHAVIOR,
    Roots = 37 => crate::runtime::ROOTS_BEHAVIOR,
    MutableRoots = 38 => crate::runtime::MUTABLE_ROOTS_BEHAVIOR,
    LiteralAst = 39 => crate::syntax::LITERAL_AST_BEHAVIOR,
    ArrayAst = 40 => crate::syntax::ARRAY_AST_BEHAVIOR,
    InvocationAst = 41 => crate::syntax::INVOCATION_AST_BEHAVIOR,
    SequenceAst = 42 => crate::syntax::SEQUENCE_AST_BEHAVIOR,
    LocalDeclarationAst = 43 => crate::syntax::LOCAL_DECLARATION_AST_BEHAVIOR,
    VariableLoadAst = 44 => crate::syntax::VARIABLE_LOAD_AST_BEHAVIOR,
    VariableAssignmentAst = 45 => crate::syntax::VARIABLE_ASSIGNMENT_AST_BEHAVIOR,
    LambdaAst = 46 => crate::syntax::LAMBDA_AST_BEHAVIOR,
    BlockAst = 47 => crate::syntax::BLOCK_AST_BEHAVIOR,
    EscapeAst = 48 => crate::syntax::ESCAPE_AST_BEHAVIOR,
    EnsureAst = 49 => crate::syntax::ENSURE_AST_BEHAVIOR,
    SignalAst = 50 => crate::syntax::SIGNAL_AST_BEHAVIOR,
    SignalHandlerAst = 51 => crate::syntax::SIGNAL_HANDLER_AST_BEHAVIOR,
    ParameterAst = 52 => crate::syntax::PARAMETER_AST_BEHAVIOR,
    SignatureAst = 53 => crate::syntax::SIGNATURE_AST_BEHAVIOR,
    MethodAst = 54 => crate::syntax::METHOD_AST_BEHAVIOR,
    SymbolAst = 55 => crate::syntax::SYMBOL_AST_BEHAVIOR,
}


// --- D i s p a t c h e r s ---

pub fn object_layout(heap: &Heap, value: Value) -> ObjectLayout {
    (object::get_behavior(heap, value).layout)(heap, value)
}

pub fn object_validate(heap: &Heap, value: Value) -> Result<()> {
    (object::get_behavior(heap, value).validate)(heap, value)
}

// The mode of any value. Immediates are deep frozen by construction;
// derived objects answer for their host's storage and count mutable.
pub fn get_value_mode(heap: &Heap, value: Value) -> Mode {
    match value.domain() {
        Domain::HeapObject => {
            let behavior = object::get_behavior(heap, value);
            match behavior.mode_rule {
                ModeRule::Fixed(mode) => mode,
                ModeRule::FromSpecies => {
                    object::get_species_mode(heap, object::get_species(heap, value))
                }
            }
        }
        Domain::DerivedObject => Mode::Mutable,
        _ => Mode::DeepFrozen,
    }
}


// --- I d e n t i t y   h a s h ---

pub fn value_transient_identity_hash(heap: &Heap, value: Value) -> Result<i64> {
    let mut stream = HashStream::new();
    let mut detector = CycleDetector::new();
    hash_value_into(heap, value, &mut stream, &mut detector)?;
    Ok(stream.finish())
}

pub fn hash_value_into(
    heap: &Heap,
    value: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<()> {
    match value.domain() {
        Domain::HeapObject => {
            let behavior = object::get_behavior(heap, value);
            match behavior.transient_identity_hash {
                Some(hash) => hash(heap, value, stream, detector),
                // Identity-hashed families hash by address; the hash
                // is transient since a collection moves the object.
                None => {
                    stream.write_u64(value.raw());
                    Ok(())
                }
            }
        }
        _ => {
            stream.write_u64(value.raw());
            Ok(())
        }
    }
}

pub fn array_transient_identity_hash(
    heap: &Heap,
    value: Value,
    stream: &mut HashStream,
    detector: &mut CycleDetector,
) -> Result<()> {
    detector.enter(value)?;
    let length = object::get_array_length(heap, value);
    stream.write_u64(length);
    let mut result = Ok(());
    for i in 0..length {
        let element = object::get_array_at(heap, value, i);
        result = hash_value_into(heap, element, stream, detector);
        if result.is_err() {
            break;
        }
    }
    detector.leave();
    result
}


// --- I d e n t i t y   c o m p a r e ---

// Deep identity. Objects of identity-compared families are equal only
// when they are the same object; value families compare contents.
pub fn value_identity_compare(heap: &Heap, a: Value, b: Value) -> Result<bool> {
    let mut detector = CycleDetector::new();
    compare_values_inner(heap, a, b, &mut detector)
}

pub fn compare_values_inner(
    heap: &Heap,
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool> {
    if a.is_same(b) {
        return Ok(true);
    }
    if a.domain() != b.domain() {
        return Ok(false);
    }
    if a.domain() != Domain::HeapObject {
        return Ok(false);
    }
    let a_family = object::get_family(heap, a);
    if a_family != object::get_family(heap, b) {
        return Ok(false);
    }
    match family_behavior(a_family).identity_compare {
        Some(compare) => compare(heap, a, b, detector),
        None => Ok(false),
    }
}

pub fn array_identity_compare(
    heap: &Heap,
    a: Value,
    b: Value,
    detector: &mut CycleDetector,
) -> Result<bool> {
    let length = object::get_array_length(heap, a);
    if length != object::get_array_length(heap, b) {
        return Ok(false);
    }
    detector.enter(a)?;
    let mut result = Ok(true);
    for i in 0..length {
        let a_element = object::get_array_at(heap, a, i);
        let b_element = object::get_array_at(heap, b, i);
        match compare_values_inner(heap, a_element, b_element, detector) {
            Ok(true) => continue,
            other => {
                result = other;
                break;
            }
        }
    }
    detector.leave();
    result
}


// --- O r d e r i n g ---

// The rank of a value in the canonical call tag ordering: the subject
// and selector keys are keys with the lowest ids, so keys rank before
// integers which rank before everything else.
fn ordering_class(heap: &Heap, value: Value) -> u64 {
    match value.domain() {
        Domain::HeapObject => match object::get_family(heap, value) {
            Family::Key => 0,
            Family::Utf8 => 2,
            _ => 3,
        },
        Domain::Integer => 1,
        _ => 4,
    }
}

// A total-enough ordering over the values that end up in sorted pair
// arrays. Same-family values with an ordering behavior use it; the
// rest fall back to a deterministic comparison of the encoded words.
pub fn value_ordering_compare(heap: &Heap, a: Value, b: Value) -> Value {
    let a_class = ordering_class(heap, a);
    let b_class = ordering_class(heap, b);
    if a_class != b_class {
        return value::compare_signed_integers(a_class as i64, b_class as i64);
    }
    if a.domain() == Domain::Integer {
        return value::compare_signed_integers(a.as_integer(), b.as_integer());
    }
    if a.domain() == Domain::HeapObject {
        let a_family = object::get_family(heap, a);
        if a_family == object::get_family(heap, b) {
            if let Some(ordering) = family_behavior(a_family).ordering_compare {
                return ordering(heap, a, b);
            }
        }
    }
    value::compare_signed_integers(a.raw() as i64, b.raw() as i64)
}


// --- P r i n t i n g ---

pub fn print_value(heap: &Heap, value: Value) -> String {
    let mut buffer = String::new();
    print_value_on(heap, value, &mut buffer);
    buffer
}

pub fn print_value_on(heap: &Heap, value: Value, buffer: &mut String) {
    match value.domain() {
        Domain::HeapObject => {
            let behavior = object::get_behavior(heap, value);
            match behavior.print_on {
                Some(print) => print(heap, value, buffer),
                None => {
                    buffer.push_str("#<");
                    buffer.push_str(object::get_family(heap, value).name());
                    buffer.push('>');
                }
            }
        }
        _ => buffer.push_str(&format!("{:?}", value)),
    }
}


// --- P h y l u m   b e h a v i o r ---

// The per-phylum analogue of the family table. Immediates hash and
// compare by word, so the interesting entries are names and ordering.
pub struct PhylumBehavior {
    pub phylum: Phylum,
    pub ordering_compare: Option<fn(Value, Value) -> Value>,
}

pub fn phylum_behavior(phylum: Phylum) -> &'static PhylumBehavior {
    static NOTHING: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::Nothing, ordering_compare: None };
    static NULL: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::Null, ordering_compare: None };
    static BOOLEAN: PhylumBehavior = PhylumBehavior {
        phylum: Phylum::Boolean,
        ordering_compare: Some(|a, b| {
            value::compare_signed_integers(a.custom_tagged_payload(), b.custom_tagged_payload())
        }),
    };
    static RELATION: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::Relation, ordering_compare: None };
    static SCORE: PhylumBehavior = PhylumBehavior {
        phylum: Phylum::Score,
        ordering_compare: Some(value::compare_scores),
    };
    static FLAG_SET: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::FlagSet, ordering_compare: None };
    static STAGE_OFFSET: PhylumBehavior = PhylumBehavior {
        phylum: Phylum::StageOffset,
        ordering_compare: Some(|a, b| {
            value::compare_signed_integers(a.custom_tagged_payload(), b.custom_tagged_payload())
        }),
    };
    static ANCHOR: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::DerivedObjectAnchor, ordering_compare: None };
    static ASCII: PhylumBehavior = PhylumBehavior {
        phylum: Phylum::AsciiCharacter,
        ordering_compare: Some(|a, b| {
            value::compare_signed_integers(a.custom_tagged_payload(), b.custom_tagged_payload())
        }),
    };
    static HASH_CODE: PhylumBehavior =
        PhylumBehavior { phylum: Phylum::HashCode, ordering_compare: None };
    match phylum {
        Phylum::Nothing => &NOTHING,
        Phylum::Null => &NULL,
        Phylum::Boolean => &BOOLEAN,
        Phylum::Relation => &RELATION,
        Phylum::Score => &SCORE,
        Phylum::FlagSet => &FLAG_SET,
        Phylum::StageOffset => &STAGE_OFFSET,
        Phylum::DerivedObjectAnchor => &ANCHOR,
        Phylum::AsciiCharacter => &ASCII,
        Phylum::HashCode => &HASH_CODE,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{new_heap_array, new_heap_utf8, set_array_at};
    use crate::runtime::Runtime;

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    #[test]
    fn test_every_family_has_a_behavior() {
        for &family in ALL_FAMILIES.iter() {
            let behavior = family_behavior(family);
            // A behavior must at least describe a nonempty layout rule
            // and a name.
            assert!(!family.name().is_empty());
            let _ = behavior.deep_frozen_field_validation;
        }
        assert_eq!(ALL_FAMILIES.len(), FAMILY_COUNT);
    }

    #[test]
    fn test_immediates_hash_by_word() {
        let heap = Heap::new(16);
        let a = value_transient_identity_hash(&heap, Value::new_integer(7)).unwrap();
        let b = value_transient_identity_hash(&heap, Value::new_integer(7)).unwrap();
        let c = value_transient_identity_hash(&heap, Value::new_integer(8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_array_deep_compare() {
        let mut runtime = new_test_runtime();
        let a = new_heap_array(&mut runtime, 2).unwrap();
        let b = new_heap_array(&mut runtime, 2).unwrap();
        for array in [a, b].iter() {
            set_array_at(&mut runtime.heap, *array, 0, Value::new_integer(1));
            set_array_at(&mut runtime.heap, *array, 1, Value::new_integer(2));
        }
        assert!(value_identity_compare(&runtime.heap, a, b).unwrap());
        set_array_at(&mut runtime.heap, b, 1, Value::new_integer(3));
        assert!(!value_identity_compare(&runtime.heap, a, b).unwrap());

        let a_hash = value_transient_identity_hash(&runtime.heap, a).unwrap();
        set_array_at(&mut runtime.heap, b, 1, Value::new_integer(2));
        let b_hash = value_transient_identity_hash(&runtime.heap, b).unwrap();
        assert_eq!(a_hash, b_hash);
    }

    #[test]
    fn test_cycle_detection() {
        let mut runtime = new_test_runtime();
        let a = new_heap_array(&mut runtime, 1).unwrap();
        let b = new_heap_array(&mut runtime, 1).unwrap();
        // a -> b -> a closes a cycle.
        set_array_at(&mut runtime.heap, a, 0, b);
        set_array_at(&mut runtime.heap, b, 0, a);
        let err = value_transient_identity_hash(&runtime.heap, a).unwrap_err();
        assert_eq!(err.cause(), value::Cause::Circular);
        // Comparing two structurally-identical cycles reports circular
        // rather than looping.
        let err = value_identity_compare(&runtime.heap, a, b).unwrap_err();
        assert_eq!(err.cause(), value::Cause::Circular);
    }

    #[test]
    fn test_string_identity() {
        let mut runtime = new_test_runtime();
        let a = new_heap_utf8(&mut runtime, "knuth").unwrap();
        let b = new_heap_utf8(&mut runtime, "knuth").unwrap();
        assert!(!a.is_same(b));
        assert!(value_identity_compare(&runtime.heap, a, b).unwrap());
        let a_hash = value_transient_identity_hash(&runtime.heap, a).unwrap();
        let b_hash = value_transient_identity_hash(&runtime.heap, b).unwrap();
        assert_eq!(a_hash, b_hash);
    }

    #[test]
    fn test_ordering_classes() {
        let mut runtime = new_test_runtime();
        let subject = runtime.roots().subject_key;
        let string = new_heap_utf8(&mut runtime, "zzz").unwrap();
        let int = Value::new_integer(100);
        // Keys before integers before strings.
        assert!(value_ordering_compare(&runtime.heap, subject, int).is_same(value::less_than()));
        assert!(value_ordering_compare(&runtime.heap, int, string).is_same(value::less_than()));
        assert!(value_ordering_compare(&runtime.heap, string, subject).is_same(value::greater_than()));
    }
}
