// (C) 2020 Brandon Lewis
//
// The uniform value representation.
//
// Every runtime value is a single 64-bit word. The low three bits hold
// the value's domain; what the rest of the word means depends on it.
//
// *Domains*
//
// - Integer: a small signed integer stored shifted up by the tag width.
// - HeapObject: the word-address of an object in the heap.
// - CustomTagged: an immediate with an 8-bit phylum tag and a 48-bit
//   signed payload. Booleans, null, scores, flag sets, etc. live here.
// - Condition: an immediate error with an 8-bit cause and 32 bits of
//   details. Conditions are never valid program values; they exist to
//   be returned from fallible operations.
// - MovedObject: a forwarding pointer. Only the garbage collector
//   creates these and they never survive a collection.
// - DerivedObject: the word-address of a location *inside* a heap
//   object, marked by an anchor word at the target.
//
// All non-pointer domains are immediates: comparing the encoded words
// compares the values, and no allocation is ever needed to produce one.

use std::fmt;
use enumflags2::{BitFlags, RawBitFlags};


// Number of low bits used for the domain tag.
pub const DOMAIN_TAG_BITS: u32 = 3;

// Bits of payload available to a custom tagged value.
pub const CUSTOM_TAGGED_PAYLOAD_BITS: u32 = 48;

// Bits of subscore within a tagged score.
pub const SCORE_SUBSCORE_BITS: u32 = 32;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    Integer = 0,
    HeapObject = 1,
    CustomTagged = 2,
    Condition = 3,
    MovedObject = 4,
    DerivedObject = 5,
}


// The sub-tag of a custom tagged value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phylum {
    Nothing = 0,
    Null = 1,
    Boolean = 2,
    Relation = 3,
    Score = 4,
    FlagSet = 5,
    StageOffset = 6,
    DerivedObjectAnchor = 7,
    AsciiCharacter = 8,
    HashCode = 9,
}

pub const PHYLUM_COUNT: usize = 10;

impl Phylum {
    pub fn from_u8(raw: u8) -> Phylum {
        match raw {
            0 => Phylum::Nothing,
            1 => Phylum::Null,
            2 => Phylum::Boolean,
            3 => Phylum::Relation,
            4 => Phylum::Score,
            5 => Phylum::FlagSet,
            6 => Phylum::StageOffset,
            7 => Phylum::DerivedObjectAnchor,
            8 => Phylum::AsciiCharacter,
            9 => Phylum::HashCode,
            _ => panic!("invalid phylum {}", raw),
        }
    }
}


// Why a condition arose. The details word refines some of these; see
// the constructors below.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cause {
    HeapExhausted = 0,
    OutOfMemory = 1,
    InvalidSyntax = 2,
    InvalidInput = 3,
    NotDeepFrozen = 4,
    InvalidModeChange = 5,
    UnsupportedBehavior = 6,
    LookupError = 7,
    SystemError = 8,
    NotFound = 9,
    UnknownBuiltin = 10,
    Signal = 11,
    UncaughtSignal = 12,
    ValidationFailed = 13,
    MapFull = 14,
    Circular = 15,
    NothingFound = 16,
    Wat = 17,
}

impl Cause {
    pub fn from_u8(raw: u8) -> Cause {
        match raw {
            0 => Cause::HeapExhausted,
            1 => Cause::OutOfMemory,
            2 => Cause::InvalidSyntax,
            3 => Cause::InvalidInput,
            4 => Cause::NotDeepFrozen,
            5 => Cause::InvalidModeChange,
            6 => Cause::UnsupportedBehavior,
            7 => Cause::LookupError,
            8 => Cause::SystemError,
            9 => Cause::NotFound,
            10 => Cause::UnknownBuiltin,
            11 => Cause::Signal,
            12 => Cause::UncaughtSignal,
            13 => Cause::ValidationFailed,
            14 => Cause::MapFull,
            15 => Cause::Circular,
            16 => Cause::NothingFound,
            17 => Cause::Wat,
            _ => panic!("invalid condition cause {}", raw),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cause::HeapExhausted => "HeapExhausted",
            Cause::OutOfMemory => "OutOfMemory",
            Cause::InvalidSyntax => "InvalidSyntax",
            Cause::InvalidInput => "InvalidInput",
            Cause::NotDeepFrozen => "NotDeepFrozen",
            Cause::InvalidModeChange => "InvalidModeChange",
            Cause::UnsupportedBehavior => "UnsupportedBehavior",
            Cause::LookupError => "LookupError",
            Cause::SystemError => "SystemError",
            Cause::NotFound => "NotFound",
            Cause::UnknownBuiltin => "UnknownBuiltin",
            Cause::Signal => "Signal",
            Cause::UncaughtSignal => "UncaughtSignal",
            Cause::ValidationFailed => "ValidationFailed",
            Cause::MapFull => "MapFull",
            Cause::Circular => "Circular",
            Cause::NothingFound => "Nothing",
            Cause::Wat => "Wat",
        }
    }
}


// Refinements of Cause::LookupError.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupError {
    Unspecified = 0,
    Ambiguity = 1,
    Namespace = 2,
    NoMatch = 3,
    NoSuchStage = 4,
    UnresolvedImport = 5,
}

// Refinements of Cause::InvalidSyntax.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyntaxError {
    Unspecified = 0,
    ExpectedSymbol = 1,
    NotSyntax = 2,
    SymbolAlreadyBound = 3,
    SymbolNotBound = 4,
}

// Refinements of Cause::SystemError.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SystemError {
    Unspecified = 0,
    AllocationFailed = 1,
    FileNotFound = 2,
    SystemCallFailed = 3,
}


// How two values relate under ordering comparison. The bit pattern
// permits treating a relation as a set when testing le/ge.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    LessThan = 0x1,
    Equal = 0x2,
    GreaterThan = 0x4,
    Unordered = 0x8,
}


// The bracket of a dispatch score. Any Eq score beats any Is score
// which beats any Any score; within a category smaller subscores win.
// The encoding makes the whole score comparable as a single integer:
// category in the high bits, subscore below.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScoreCategory {
    Eq = 0,
    Is = 1,
    Any = 2,
    Extra = 3,
    None = 4,
}


#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u64);

// A condition; always holds a value in the Condition domain. Wrapping
// it in its own type lets fallible operations use ? while keeping the
// error representable as an ordinary immediate word.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Condition(Value);

pub type Result<T> = std::result::Result<T, Condition>;


impl Value {
    pub fn from_raw(raw: u64) -> Value {
        Value(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn domain(self) -> Domain {
        match self.0 & ((1 << DOMAIN_TAG_BITS) - 1) {
            0 => Domain::Integer,
            1 => Domain::HeapObject,
            2 => Domain::CustomTagged,
            3 => Domain::Condition,
            4 => Domain::MovedObject,
            5 => Domain::DerivedObject,
            d => panic!("invalid domain {}", d),
        }
    }

    // Identity on the encoded word. For immediates this is value
    // identity; for objects it is pointer identity. Deep structural
    // identity lives in behavior::value_identity_compare.
    pub fn is_same(self, other: Value) -> bool {
        self.0 == other.0
    }

    pub fn is_immediate(self) -> bool {
        match self.domain() {
            Domain::HeapObject | Domain::DerivedObject => false,
            _ => true,
        }
    }

    // --- Integers ---

    pub fn new_integer(value: i64) -> Value {
        Value((value << DOMAIN_TAG_BITS) as u64)
    }

    pub fn is_integer(self) -> bool {
        self.domain() == Domain::Integer
    }

    pub fn as_integer(self) -> i64 {
        debug_assert!(self.is_integer());
        (self.0 as i64) >> DOMAIN_TAG_BITS
    }

    // --- Heap objects ---

    pub fn new_heap_object(addr: u64) -> Value {
        Value((addr << DOMAIN_TAG_BITS) | Domain::HeapObject as u64)
    }

    pub fn is_heap_object(self) -> bool {
        self.domain() == Domain::HeapObject
    }

    pub fn as_heap_object(self) -> u64 {
        debug_assert!(self.is_heap_object());
        self.0 >> DOMAIN_TAG_BITS
    }

    // --- Moved objects ---

    pub fn new_moved_object(target: Value) -> Value {
        debug_assert!(target.is_heap_object());
        Value((target.as_heap_object() << DOMAIN_TAG_BITS)
            | Domain::MovedObject as u64)
    }

    pub fn is_moved_object(self) -> bool {
        self.domain() == Domain::MovedObject
    }

    pub fn moved_object_target(self) -> Value {
        debug_assert!(self.is_moved_object());
        Value::new_heap_object(self.0 >> DOMAIN_TAG_BITS)
    }

    // --- Derived objects ---

    pub fn new_derived_object(addr: u64) -> Value {
        Value((addr << DOMAIN_TAG_BITS) | Domain::DerivedObject as u64)
    }

    pub fn is_derived_object(self) -> bool {
        self.domain() == Domain::DerivedObject
    }

    pub fn as_derived_object(self) -> u64 {
        debug_assert!(self.is_derived_object());
        self.0 >> DOMAIN_TAG_BITS
    }

    // --- Custom tagged ---

    pub fn new_custom_tagged(phylum: Phylum, payload: i64) -> Value {
        Value(((payload as u64) << 16)
            | ((phylum as u64) << 8)
            | Domain::CustomTagged as u64)
    }

    pub fn is_custom_tagged(self) -> bool {
        self.domain() == Domain::CustomTagged
    }

    pub fn phylum(self) -> Phylum {
        debug_assert!(self.is_custom_tagged());
        Phylum::from_u8(((self.0 >> 8) & 0xFF) as u8)
    }

    pub fn in_phylum(self, phylum: Phylum) -> bool {
        self.is_custom_tagged() && self.phylum() == phylum
    }

    pub fn custom_tagged_payload(self) -> i64 {
        debug_assert!(self.is_custom_tagged());
        (self.0 as i64) >> 16
    }

    // --- Conditions ---

    pub fn is_condition(self) -> bool {
        self.domain() == Domain::Condition
    }

    pub fn in_condition_cause(self, cause: Cause) -> bool {
        self.is_condition() && self.condition_cause() == cause
    }

    pub fn condition_cause(self) -> Cause {
        debug_assert!(self.is_condition());
        Cause::from_u8(((self.0 >> 8) & 0xFF) as u8)
    }

    pub fn condition_details(self) -> u32 {
        debug_assert!(self.is_condition());
        (self.0 >> 16) as u32
    }

    // Splits an in-band value into the Result form used by the Rust
    // API surface.
    pub fn to_result(self) -> Result<Value> {
        if self.is_condition() {
            Err(Condition(self))
        } else {
            Ok(self)
        }
    }
}


// --- The singletons ---

pub fn nothing() -> Value {
    Value::new_custom_tagged(Phylum::Nothing, 0)
}

pub fn null() -> Value {
    Value::new_custom_tagged(Phylum::Null, 0)
}

pub fn yes() -> Value {
    Value::new_custom_tagged(Phylum::Boolean, 1)
}

pub fn no() -> Value {
    Value::new_custom_tagged(Phylum::Boolean, 0)
}

pub fn new_boolean(value: bool) -> Value {
    if value { yes() } else { no() }
}

pub fn is_nothing(value: Value) -> bool {
    value.is_same(nothing())
}

pub fn is_null(value: Value) -> bool {
    value.is_same(null())
}

pub fn get_boolean_value(value: Value) -> bool {
    debug_assert!(value.in_phylum(Phylum::Boolean));
    value.custom_tagged_payload() != 0
}


// --- Relations ---

pub fn new_relation(rel: Relation) -> Value {
    Value::new_custom_tagged(Phylum::Relation, rel as i64)
}

pub fn less_than() -> Value {
    new_relation(Relation::LessThan)
}

pub fn greater_than() -> Value {
    new_relation(Relation::GreaterThan)
}

pub fn equal() -> Value {
    new_relation(Relation::Equal)
}

pub fn unordered() -> Value {
    new_relation(Relation::Unordered)
}

pub fn compare_signed_integers(a: i64, b: i64) -> Value {
    if a < b {
        less_than()
    } else if a == b {
        equal()
    } else {
        greater_than()
    }
}

pub fn relation_to_integer(value: Value) -> i64 {
    debug_assert!(value.in_phylum(Phylum::Relation));
    match value.custom_tagged_payload() {
        x if x == Relation::LessThan as i64 => -1,
        x if x == Relation::Equal as i64 => 0,
        _ => 1,
    }
}


// --- Stage offsets ---

pub fn new_stage_offset(offset: i32) -> Value {
    Value::new_custom_tagged(Phylum::StageOffset, offset as i64)
}

pub fn present_stage() -> Value {
    new_stage_offset(0)
}

pub fn past_stage() -> Value {
    new_stage_offset(-1)
}

pub fn get_stage_offset(value: Value) -> i32 {
    debug_assert!(value.in_phylum(Phylum::StageOffset));
    value.custom_tagged_payload() as i32
}


// --- Ascii characters ---

pub fn new_ascii_character(value: u8) -> Value {
    Value::new_custom_tagged(Phylum::AsciiCharacter, value as i64)
}


// --- Hash codes ---

// Wraps a calculated hash in a tagged value. Codes wider than the
// payload lose their top bits; the top representable bit is smeared so
// truncation stays sign-consistent.
pub fn new_hash_code(code: u64) -> Value {
    let discard = 64 - CUSTOM_TAGGED_PAYLOAD_BITS;
    let truncated = ((code as i64) << discard) >> discard;
    Value::new_custom_tagged(Phylum::HashCode, truncated)
}

pub fn get_hash_code_value(value: Value) -> i64 {
    debug_assert!(value.in_phylum(Phylum::HashCode));
    value.custom_tagged_payload()
}


// --- Flag sets ---

// A flag set is a custom tagged set of up to 32 flags. An integer
// would do but a separate phylum lets the runtime type-check them.
pub fn new_flag_set<T>(flags: BitFlags<T>) -> Value
where T: RawBitFlags<Type = u8> {
    Value::new_custom_tagged(Phylum::FlagSet, flags.bits() as i64)
}

pub fn empty_flag_set() -> Value {
    Value::new_custom_tagged(Phylum::FlagSet, 0)
}

pub fn get_flag_set<T>(value: Value) -> BitFlags<T>
where T: RawBitFlags<Type = u8> {
    debug_assert!(value.in_phylum(Phylum::FlagSet));
    BitFlags::from_bits_truncate(value.custom_tagged_payload() as u8)
}

pub fn flag_set_is_empty(value: Value) -> bool {
    debug_assert!(value.in_phylum(Phylum::FlagSet));
    value.custom_tagged_payload() == 0
}


// --- Scores ---

pub fn new_score(category: ScoreCategory, subscore: u32) -> Value {
    let payload = ((category as i64) << SCORE_SUBSCORE_BITS) | subscore as i64;
    Value::new_custom_tagged(Phylum::Score, payload)
}

pub fn new_identical_match_score() -> Value {
    new_score(ScoreCategory::Eq, 0)
}

pub fn new_perfect_is_match_score() -> Value {
    new_score(ScoreCategory::Is, 0)
}

pub fn new_any_match_score() -> Value {
    new_score(ScoreCategory::Any, 0)
}

pub fn new_extra_match_score() -> Value {
    new_score(ScoreCategory::Extra, 0)
}

pub fn new_no_match_score() -> Value {
    new_score(ScoreCategory::None, 0)
}

pub fn get_score_category(value: Value) -> ScoreCategory {
    debug_assert!(value.in_phylum(Phylum::Score));
    match value.custom_tagged_payload() >> SCORE_SUBSCORE_BITS {
        0 => ScoreCategory::Eq,
        1 => ScoreCategory::Is,
        2 => ScoreCategory::Any,
        3 => ScoreCategory::Extra,
        _ => ScoreCategory::None,
    }
}

pub fn get_score_subscore(value: Value) -> u32 {
    debug_assert!(value.in_phylum(Phylum::Score));
    value.custom_tagged_payload() as u32
}

// A score is a match if it belongs to any category but None.
pub fn is_score_match(value: Value) -> bool {
    get_score_category(value) != ScoreCategory::None
}

// Compares by category first, then subscore; smaller payload wins on
// both counts because the category sits in the high bits.
pub fn is_score_better(a: Value, b: Value) -> bool {
    a.custom_tagged_payload() < b.custom_tagged_payload()
}

pub fn compare_scores(a: Value, b: Value) -> Value {
    compare_signed_integers(a.custom_tagged_payload(), b.custom_tagged_payload())
}

// The next-worse score within the same category. Used while climbing
// the inheritance chain during is-guard matching.
pub fn get_score_successor(value: Value) -> Value {
    debug_assert!(get_score_category(value) != ScoreCategory::None);
    Value::new_custom_tagged(Phylum::Score, value.custom_tagged_payload() + 1)
}


// --- Derived object anchors ---

// The genus of a derived object: which kind of scoped section it is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Genus {
    EscapeSection = 0,
    EnsureSection = 1,
    SignalHandlerSection = 2,
    BlockSection = 3,
}

pub const GENUS_TAG_BITS: u32 = 3;

impl Genus {
    pub fn from_u8(raw: u8) -> Genus {
        match raw {
            0 => Genus::EscapeSection,
            1 => Genus::EnsureSection,
            2 => Genus::SignalHandlerSection,
            3 => Genus::BlockSection,
            _ => panic!("invalid genus {}", raw),
        }
    }
}

// The anchor sits in the host at the address the derived pointer
// refers to; it records the genus and the offset back to the host
// header so the collector can recover the host from the pointer alone.
pub fn new_derived_object_anchor(genus: Genus, host_offset: u64) -> Value {
    let payload = ((host_offset << GENUS_TAG_BITS) | genus as u64) as i64;
    Value::new_custom_tagged(Phylum::DerivedObjectAnchor, payload)
}

pub fn get_anchor_genus(value: Value) -> Genus {
    debug_assert!(value.in_phylum(Phylum::DerivedObjectAnchor));
    Genus::from_u8((value.custom_tagged_payload() as u64
        & ((1 << GENUS_TAG_BITS) - 1)) as u8)
}

pub fn get_anchor_host_offset(value: Value) -> u64 {
    debug_assert!(value.in_phylum(Phylum::DerivedObjectAnchor));
    (value.custom_tagged_payload() as u64) >> GENUS_TAG_BITS
}


// --- Condition constructors ---

impl Condition {
    pub fn new(cause: Cause) -> Condition {
        Condition::with_details(cause, 0)
    }

    pub fn with_details(cause: Cause, details: u32) -> Condition {
        Condition(Value(((details as u64) << 16)
            | ((cause as u64) << 8)
            | Domain::Condition as u64))
    }

    pub fn from_value(value: Value) -> Condition {
        debug_assert!(value.is_condition());
        Condition(value)
    }

    pub fn to_value(self) -> Value {
        self.0
    }

    pub fn cause(self) -> Cause {
        self.0.condition_cause()
    }

    pub fn details(self) -> u32 {
        self.0.condition_details()
    }

    pub fn heap_exhausted(requested: u64) -> Condition {
        Condition::with_details(Cause::HeapExhausted, requested as u32)
    }

    pub fn out_of_memory() -> Condition {
        Condition::new(Cause::OutOfMemory)
    }

    pub fn not_found() -> Condition {
        Condition::new(Cause::NotFound)
    }

    pub fn map_full() -> Condition {
        Condition::new(Cause::MapFull)
    }

    pub fn circular() -> Condition {
        Condition::new(Cause::Circular)
    }

    pub fn wat() -> Condition {
        Condition::new(Cause::Wat)
    }

    pub fn validation_failed() -> Condition {
        Condition::new(Cause::ValidationFailed)
    }

    pub fn not_deep_frozen() -> Condition {
        Condition::new(Cause::NotDeepFrozen)
    }

    pub fn invalid_mode_change(current: u32) -> Condition {
        Condition::with_details(Cause::InvalidModeChange, current)
    }

    pub fn invalid_input() -> Condition {
        Condition::new(Cause::InvalidInput)
    }

    // The hint is a four character tag describing the problem, packed
    // into the details word.
    pub fn invalid_input_hint(hint: &str) -> Condition {
        let mut details = [0u8; 4];
        for (i, b) in hint.bytes().take(4).enumerate() {
            details[i] = b;
        }
        Condition::with_details(Cause::InvalidInput, u32::from_le_bytes(details))
    }

    pub fn lookup_error(error: LookupError) -> Condition {
        Condition::with_details(Cause::LookupError, error as u32)
    }

    pub fn lookup_error_cause(self) -> LookupError {
        debug_assert!(self.cause() == Cause::LookupError);
        match self.details() {
            1 => LookupError::Ambiguity,
            2 => LookupError::Namespace,
            3 => LookupError::NoMatch,
            4 => LookupError::NoSuchStage,
            5 => LookupError::UnresolvedImport,
            _ => LookupError::Unspecified,
        }
    }

    pub fn invalid_syntax(error: SyntaxError) -> Condition {
        Condition::with_details(Cause::InvalidSyntax, error as u32)
    }

    pub fn system_error(error: SystemError) -> Condition {
        Condition::with_details(Cause::SystemError, error as u32)
    }

    pub fn unknown_builtin() -> Condition {
        Condition::new(Cause::UnknownBuiltin)
    }

    pub fn signal() -> Condition {
        Condition::new(Cause::Signal)
    }

    // The detail bit records whether the signal was escaping.
    pub fn uncaught_signal(is_escape: bool) -> Condition {
        Condition::with_details(Cause::UncaughtSignal, is_escape as u32)
    }

    // Details encode which behavior was missing and on what. The kind
    // sits in the low byte, the family above it.
    pub fn unsupported_behavior(family: u32, kind: u32) -> Condition {
        Condition::with_details(Cause::UnsupportedBehavior, (family << 8) | kind)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%<{}", self.cause().name())?;
        if self.details() != 0 {
            write!(f, "({})", self.details())?;
        }
        write!(f, ">")
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.domain() {
            Domain::Integer => write!(f, "{}", self.as_integer()),
            Domain::HeapObject => write!(f, "#<@{}>", self.as_heap_object()),
            Domain::DerivedObject => write!(f, "#<&@{}>", self.as_derived_object()),
            Domain::MovedObject => write!(f, "#<moved>"),
            Domain::Condition => fmt::Debug::fmt(&Condition(*self), f),
            Domain::CustomTagged => match self.phylum() {
                Phylum::Nothing => write!(f, "#<nothing>"),
                Phylum::Null => write!(f, "null"),
                Phylum::Boolean => {
                    write!(f, "{}", if get_boolean_value(*self) { "true" } else { "false" })
                }
                phylum => write!(f, "#<{:?}: {}>", phylum, self.custom_tagged_payload()),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding() {
        for &v in &[0i64, 1, -1, 1024, -1024, (1 << 50), -(1 << 50)] {
            let value = Value::new_integer(v);
            assert_eq!(value.domain(), Domain::Integer);
            assert_eq!(value.as_integer(), v);
            assert!(value.is_immediate());
        }
    }

    #[test]
    fn test_identity_is_word_identity() {
        assert!(Value::new_integer(7).is_same(Value::new_integer(7)));
        assert!(!Value::new_integer(7).is_same(Value::new_integer(8)));
        assert!(yes().is_same(new_boolean(true)));
        assert!(!yes().is_same(no()));
        assert!(nothing().is_same(nothing()));
        assert!(!nothing().is_same(null()));
    }

    #[test]
    fn test_heap_object_round_trip() {
        let value = Value::new_heap_object(12345);
        assert_eq!(value.domain(), Domain::HeapObject);
        assert_eq!(value.as_heap_object(), 12345);
        assert!(!value.is_immediate());

        let moved = Value::new_moved_object(value);
        assert_eq!(moved.domain(), Domain::MovedObject);
        assert!(moved.moved_object_target().is_same(value));
    }

    #[test]
    fn test_custom_tagged_payload_sign() {
        let pos = Value::new_custom_tagged(Phylum::StageOffset, 3);
        assert_eq!(pos.custom_tagged_payload(), 3);
        let neg = Value::new_custom_tagged(Phylum::StageOffset, -2);
        assert_eq!(neg.custom_tagged_payload(), -2);
        assert_eq!(neg.phylum(), Phylum::StageOffset);
    }

    #[test]
    fn test_conditions() {
        let cond = Condition::heap_exhausted(512);
        assert_eq!(cond.cause(), Cause::HeapExhausted);
        assert_eq!(cond.details(), 512);
        assert!(cond.to_value().is_condition());
        assert!(cond.to_value().in_condition_cause(Cause::HeapExhausted));

        let lookup = Condition::lookup_error(LookupError::Ambiguity);
        assert_eq!(lookup.cause(), Cause::LookupError);
        assert_eq!(lookup.lookup_error_cause(), LookupError::Ambiguity);

        assert!(Value::new_integer(0).to_result().is_ok());
        assert!(cond.to_value().to_result().is_err());
    }

    #[test]
    fn test_score_ordering() {
        let eq = new_identical_match_score();
        let is0 = new_perfect_is_match_score();
        let is1 = get_score_successor(is0);
        let any = new_any_match_score();
        let extra = new_extra_match_score();
        let none = new_no_match_score();

        assert!(is_score_better(eq, is0));
        assert!(is_score_better(is0, is1));
        assert!(is_score_better(is1, any));
        assert!(is_score_better(any, extra));
        assert!(is_score_better(extra, none));
        assert!(!is_score_better(is0, eq));
        assert!(!is_score_better(eq, eq));

        assert!(is_score_match(eq));
        assert!(is_score_match(extra));
        assert!(!is_score_match(none));

        assert_eq!(get_score_category(is1), ScoreCategory::Is);
        assert_eq!(get_score_subscore(is1), 1);
    }

    #[test]
    fn test_relations() {
        assert!(compare_signed_integers(1, 2).is_same(less_than()));
        assert!(compare_signed_integers(2, 2).is_same(equal()));
        assert!(compare_signed_integers(3, 2).is_same(greater_than()));
        assert_eq!(relation_to_integer(less_than()), -1);
        assert_eq!(relation_to_integer(equal()), 0);
        assert_eq!(relation_to_integer(greater_than()), 1);
    }

    #[test]
    fn test_anchors() {
        let anchor = new_derived_object_anchor(Genus::EscapeSection, 40);
        assert_eq!(get_anchor_genus(anchor), Genus::EscapeSection);
        assert_eq!(get_anchor_host_offset(anchor), 40);
    }

    #[test]
    fn test_hash_code_truncation() {
        let code = new_hash_code(0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(get_hash_code_value(code), -1);
        let small = new_hash_code(42);
        assert_eq!(get_hash_code_value(small), 42);
    }
}
