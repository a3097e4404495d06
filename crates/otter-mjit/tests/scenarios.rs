//! End-to-end behavior of compiled code: compile, publish, run on the
//! executor, and compare against what the generic path computes.

use std::sync::Arc;

use otter_mjit::assembler::Inst;
use otter_mjit::{
    BailoutReason, CompileEnv, ExecOutcome, ExecStats, IcId, IcState, JitCompiler, JitConfig, Machine, NoHoisting, NoTypeInfo,
    ObjectKind, OracleTable, PublishedCode, TypeFlags, TypeOracle, TypeSet,
};
use otter_mjit_bytecode::{ArgIndex, Function, FunctionBuilder, Instruction, JumpOffset};
use otter_mjit_runtime::{Heap, ObjectClass, RawValue, Value, ops};

fn compile(heap: &mut Heap, function: &Function, oracle: &dyn TypeOracle, config: JitConfig) -> Arc<PublishedCode> {
    heap.link_function(function);
    let mut hoister = NoHoisting;
    JitCompiler::new(config)
        .compile_and_publish(
            function,
            CompileEnv {
                heap: &*heap,
                oracle,
                hoister: &mut hoister,
            },
        )
        .expect("compiles")
}

fn stats_config() -> JitConfig {
    JitConfig {
        stats: true,
        ..JitConfig::default()
    }
}

fn run(heap: &mut Heap, code: &PublishedCode, function: &Function, args: &[Value]) -> (ExecOutcome, ExecStats) {
    let mut machine = Machine::with_config(heap, stats_config());
    let outcome = machine.run(code, function, args).expect("runs");
    (outcome, machine.stats())
}

fn returned(outcome: ExecOutcome) -> Value {
    match outcome {
        ExecOutcome::Return(value) => value,
        ExecOutcome::Bailout(state) => panic!("unexpected bailout: {state:?}"),
    }
}

fn arg(idx: u16) -> Instruction {
    Instruction::GetArg { idx: ArgIndex(idx) }
}

fn binary(op: Instruction) -> Function {
    FunctionBuilder::new()
        .param_count(2)
        .instructions(vec![arg(0), arg(1), op, Instruction::Return])
        .build()
}

// ---------------------------------------------------------------------------
// Scenario: double-encoded integer through `| 0`
// ---------------------------------------------------------------------------

#[test]
fn test_bitor_zero_truncates_known_double() {
    let function = FunctionBuilder::new()
        .param_count(1)
        .instructions(vec![arg(0), Instruction::Int32 { value: 0 }, Instruction::BitOr, Instruction::Return])
        .build();
    let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::DOUBLE));
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &oracle, JitConfig::default());
    assert!(
        code.code().insts.iter().any(|i| matches!(i, Inst::BranchTruncateDoubleToInt32 { .. })),
        "expected the inline truncation"
    );

    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Double(5.0)]);
    assert_eq!(returned(outcome), Value::Int32(5));
    assert_eq!(stats.stub_calls, 0);

    let generic = compile(&mut heap, &function, &oracle, JitConfig::generic());
    let (outcome, stats) = run(&mut heap, &generic, &function, &[Value::Double(5.0)]);
    assert_eq!(returned(outcome), Value::Int32(5));
    assert_eq!(stats.stub_calls, 1);
}

#[test]
fn test_bitor_zero_out_of_range_double() {
    let function = FunctionBuilder::new()
        .param_count(1)
        .instructions(vec![arg(0), Instruction::Int32 { value: 0 }, Instruction::BitOr, Instruction::Return])
        .build();
    let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::DOUBLE));
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &oracle, JitConfig::default());

    // One step of 2^32 brings this back into range without a call.
    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Double(4294967301.0)]);
    assert_eq!(returned(outcome), Value::Int32(5));
    assert_eq!(stats.stub_calls, 0);

    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Double(1e20)]);
    assert_eq!(returned(outcome), Value::Int32(1661992960));
    assert_eq!(stats.stub_calls, 1);
}

// ---------------------------------------------------------------------------
// Scenario: aliased shift operands
// ---------------------------------------------------------------------------

#[test]
fn test_shift_by_itself() {
    let dup = FunctionBuilder::new()
        .param_count(1)
        .instructions(vec![arg(0), Instruction::Dup, Instruction::Lsh, Instruction::Return])
        .build();
    let twice = FunctionBuilder::new()
        .param_count(1)
        .instructions(vec![arg(0), arg(0), Instruction::Lsh, Instruction::Return])
        .build();
    let int_arg = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::INT32));

    let mut heap = Heap::new();
    for function in [&dup, &twice] {
        for oracle in [&NoTypeInfo as &dyn TypeOracle, &int_arg] {
            let code = compile(&mut heap, function, oracle, JitConfig::default());
            let (outcome, _) = run(&mut heap, &code, function, &[Value::Int32(3)]);
            assert_eq!(returned(outcome), Value::Int32(24));
        }
    }
}

#[test]
fn test_shift_amount_is_taken_mod_32() {
    let function = FunctionBuilder::new()
        .param_count(1)
        .instructions(vec![arg(0), Instruction::Int32 { value: 33 }, Instruction::Lsh, Instruction::Return])
        .build();
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Int32(1)]);
    assert_eq!(returned(outcome), Value::Int32(2));
    assert_eq!(stats.stub_calls, 0);

    let folded = FunctionBuilder::new()
        .instructions(vec![
            Instruction::Int32 { value: 1 },
            Instruction::Int32 { value: 33 },
            Instruction::Lsh,
            Instruction::Return,
        ])
        .build();
    let code = compile(&mut heap, &folded, &NoTypeInfo, JitConfig::default());
    assert_eq!(code.code().call_count(), 0);
    let (outcome, _) = run(&mut heap, &code, &folded, &[]);
    assert_eq!(returned(outcome), Value::Int32(2));
}

#[test]
fn test_ursh_result_above_int32_is_a_double() {
    let function = binary(Instruction::Ursh);
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    let (outcome, _) = run(&mut heap, &code, &function, &[Value::Int32(-1), Value::Int32(0)]);
    assert_eq!(returned(outcome), Value::Double(4294967295.0));
    let (outcome, _) = run(&mut heap, &code, &function, &[Value::Int32(-1), Value::Int32(28)]);
    assert_eq!(returned(outcome), Value::Int32(15));
}

// ---------------------------------------------------------------------------
// Scenario: dense write at the initialized length
// ---------------------------------------------------------------------------

fn store_function() -> Function {
    FunctionBuilder::new()
        .param_count(3)
        .instructions(vec![
            arg(0),
            arg(1),
            arg(2),
            Instruction::SetElem,
            Instruction::Pop,
            Instruction::ReturnUndefined,
        ])
        .build()
}

fn dense_store_oracle() -> OracleTable {
    OracleTable::new()
        .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
        .with_arg(1, TypeSet::of(TypeFlags::INT32))
        .with_arg(2, TypeSet::of(TypeFlags::INT32))
}

#[test]
fn test_store_at_initialized_length_extends_inline() {
    let function = store_function();
    let mut heap = Heap::new();
    let arr = heap.new_array_with_capacity(&[Value::Int32(1), Value::Int32(2), Value::Int32(3)], 8);
    let code = compile(&mut heap, &function, &dense_store_oracle(), JitConfig::default());

    let args = [Value::Object(arr), Value::Int32(3), Value::Int32(9)];
    let (outcome, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Undefined);
    assert_eq!(stats.stub_calls, 0);

    let object = heap.object(arr).expect("array");
    assert_eq!(object.initialized_length, 4);
    assert_eq!(object.length, 4);
    assert_eq!(object.elements[3], Value::Int32(9).to_raw());
}

#[test]
fn test_store_past_a_gap_takes_generic_path() {
    let function = store_function();
    let mut heap = Heap::new();
    let arr = heap.new_array_with_capacity(&[Value::Int32(1), Value::Int32(2), Value::Int32(3)], 8);
    let code = compile(&mut heap, &function, &dense_store_oracle(), JitConfig::default());

    let args = [Value::Object(arr), Value::Int32(4), Value::Int32(7)];
    let (outcome, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Undefined);
    assert_eq!(stats.stub_calls, 1);

    let object = heap.object(arr).expect("array");
    assert_eq!(object.initialized_length, 5);
    assert_eq!(object.length, 5);
    assert!(object.elements[3].is_hole());
    assert_eq!(object.elements[4], Value::Int32(7).to_raw());
}

#[test]
fn test_store_at_capacity_takes_generic_path() {
    let function = store_function();
    let mut heap = Heap::new();
    let arr = heap.new_array(&[Value::Int32(1)]);
    let code = compile(&mut heap, &function, &dense_store_oracle(), JitConfig::default());

    let args = [Value::Object(arr), Value::Int32(1), Value::Int32(2)];
    let (_, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(stats.stub_calls, 1);
    let object = heap.object(arr).expect("array");
    assert_eq!(object.length, 2);
    assert!(object.capacity() >= 2);
}

#[test]
fn test_store_in_bounds_overwrites() {
    let function = store_function();
    let mut heap = Heap::new();
    let arr = heap.new_array(&[Value::Int32(1), Value::Int32(2)]);
    let code = compile(&mut heap, &function, &dense_store_oracle(), JitConfig::default());

    let args = [Value::Object(arr), Value::Int32(0), Value::Int32(5)];
    let (_, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(stats.stub_calls, 0);
    let object = heap.object(arr).expect("array");
    assert_eq!(object.elements[0], Value::Int32(5).to_raw());
    assert_eq!(object.length, 2);
}

// ---------------------------------------------------------------------------
// Scenario: fused `typeof x === "number"` branch
// ---------------------------------------------------------------------------

fn typeof_branch(name: &str) -> Function {
    let mut builder = FunctionBuilder::new().param_count(1);
    let name = builder.string(name);
    builder
        .instructions(vec![
            arg(0),
            Instruction::TypeOf,
            Instruction::String { idx: name },
            Instruction::StrictEq,
            Instruction::IfEq { offset: JumpOffset(3) },
            Instruction::Int32 { value: 1 },
            Instruction::Return,
            Instruction::Int32 { value: 0 },
            Instruction::Return,
        ])
        .build()
}

#[test]
fn test_typeof_number_branch_is_a_tag_test() {
    let function = typeof_branch("number");
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    assert_eq!(code.code().call_count(), 0);

    let text = heap.intern("seven");
    for (input, expected) in [
        (Value::Int32(7), 1),
        (Value::Double(0.25), 1),
        (Value::String(text), 0),
        (Value::Undefined, 0),
        (Value::Boolean(true), 0),
    ] {
        let (outcome, stats) = run(&mut heap, &code, &function, &[input]);
        assert_eq!(returned(outcome), Value::Int32(expected), "typeof {input:?}");
        assert_eq!(stats.stub_calls, 0);
    }
}

#[test]
fn test_typeof_branch_matches_generic_path() {
    for name in ["undefined", "boolean", "string", "object", "function", "number"] {
        let function = typeof_branch(name);
        let mut heap = Heap::new();
        let fast = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
        let generic = compile(&mut heap, &function, &NoTypeInfo, JitConfig::generic());
        let text = heap.intern("x");
        let obj = heap.new_plain_object();
        for input in [
            Value::Int32(1),
            Value::Double(-0.0),
            Value::String(text),
            Value::Undefined,
            Value::Null,
            Value::Boolean(false),
            Value::Object(obj),
        ] {
            let (a, _) = run(&mut heap, &fast, &function, &[input]);
            let (b, _) = run(&mut heap, &generic, &function, &[input]);
            assert_eq!(returned(a), returned(b), "typeof {input:?} === {name:?}");
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario: `null == undefined`
// ---------------------------------------------------------------------------

#[test]
fn test_null_loosely_equals_undefined_statically() {
    let function = FunctionBuilder::new()
        .instructions(vec![
            Instruction::Null,
            Instruction::Undefined,
            Instruction::Eq,
            Instruction::Return,
        ])
        .build();
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    assert_eq!(code.code().call_count(), 0);
    assert!(code.code().insts.iter().all(|i| i.target().is_none()), "no guard expected");

    let (outcome, stats) = run(&mut heap, &code, &function, &[]);
    assert_eq!(returned(outcome), Value::Boolean(true));
    assert_eq!(stats.slow_steps, 0);
}

// ---------------------------------------------------------------------------
// Scenario: prototype gains an indexed property after compilation
// ---------------------------------------------------------------------------

fn load_function() -> Function {
    FunctionBuilder::new()
        .param_count(2)
        .instructions(vec![arg(0), arg(1), Instruction::GetElem, Instruction::Return])
        .build()
}

#[test]
fn test_prototype_epoch_invalidates_inline_undefined() {
    let function = load_function();
    let oracle = OracleTable::new()
        .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
        .with_arg(1, TypeSet::of(TypeFlags::INT32))
        .with_pushed(2, TypeSet::of(TypeFlags::INT32 | TypeFlags::UNDEFINED));
    let mut heap = Heap::new();
    let arr = heap.new_array_with_capacity(&[Value::Int32(10), Value::Int32(11), Value::Int32(12)], 4);
    heap.object_mut(arr).expect("array").elements[1] = RawValue::HOLE;
    let code = compile(&mut heap, &function, &oracle, JitConfig::default());

    for index in [1, 5] {
        let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(index)]);
        assert_eq!(returned(outcome), Value::Undefined, "index {index}");
        assert_eq!(stats.stub_calls, 0);
    }
    let (outcome, _) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(2)]);
    assert_eq!(returned(outcome), Value::Int32(12));

    heap.set_array_proto_element(1, Value::Int32(42));
    heap.set_array_proto_element(5, Value::Int32(43));

    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(1)]);
    assert_eq!(returned(outcome), Value::Int32(42));
    assert_eq!(stats.stub_calls, 1);
    let (outcome, _) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(5)]);
    assert_eq!(returned(outcome), Value::Int32(43));
    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(0)]);
    assert_eq!(returned(outcome), Value::Int32(10));
    assert_eq!(stats.stub_calls, 0);
}

#[test]
fn test_hole_in_packed_array_leaves_the_inline_path() {
    let function = load_function();
    let packed = |pushed| {
        OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::PackedArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32))
            .with_pushed(2, pushed)
    };
    let mut heap = Heap::new();
    let arr = heap.new_array_with_capacity(&[Value::Int32(10), Value::Int32(11)], 8);
    let maybe_undefined = compile(
        &mut heap,
        &function,
        &packed(TypeSet::of(TypeFlags::INT32 | TypeFlags::UNDEFINED)),
        JitConfig::default(),
    );
    let monitored = packed(TypeSet::of(TypeFlags::INT32)).with_monitored(2);
    let int_only = compile(&mut heap, &function, &monitored, JitConfig::default());
    assert!(
        int_only.code().insts.iter().any(|i| matches!(i, Inst::LoadPackedElement { .. })),
        "expected the packed load"
    );

    // A generic store past the end leaves holes at 2..5.
    ops::set_elem(&mut heap, Value::Object(arr), Value::Int32(5), Value::Int32(15)).expect("stores");

    let (outcome, stats) = run(&mut heap, &maybe_undefined, &function, &[Value::Object(arr), Value::Int32(3)]);
    assert_eq!(returned(outcome), Value::Undefined);
    assert_eq!(stats.hole_faults, 1);
    assert_eq!(stats.stub_calls, 0);
    let (outcome, stats) = run(&mut heap, &maybe_undefined, &function, &[Value::Object(arr), Value::Int32(5)]);
    assert_eq!(returned(outcome), Value::Int32(15));
    assert_eq!(stats.hole_faults, 0);

    heap.set_array_proto_element(3, Value::Int32(42));
    let (outcome, stats) = run(&mut heap, &int_only, &function, &[Value::Object(arr), Value::Int32(3)]);
    assert_eq!(returned(outcome), Value::Int32(42));
    assert_eq!(stats.hole_faults, 1);
    assert_eq!(stats.stub_calls, 1);

    // Without a prototype element the generic read yields `undefined`,
    // which the monitored site does not allow.
    let (outcome, stats) = run(&mut heap, &int_only, &function, &[Value::Object(arr), Value::Int32(4)]);
    let ExecOutcome::Bailout(state) = outcome else {
        panic!("expected a bailout");
    };
    assert_eq!(state.reason, BailoutReason::TypeBarrier);
    assert_eq!(state.pc, 3);
    assert_eq!(stats.hole_faults, 1);
}

#[test]
fn test_indexed_prototype_at_compile_time_disables_dense_path() {
    let function = load_function();
    let oracle = OracleTable::new()
        .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
        .with_arg(1, TypeSet::of(TypeFlags::INT32));
    let mut heap = Heap::new();
    heap.set_array_proto_element(0, Value::Int32(1));
    let code = compile(&mut heap, &function, &oracle, JitConfig::default());
    assert_eq!(code.code().ics.len(), 1);

    let arr = heap.new_array_with_capacity(&[], 2);
    let (outcome, _) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(0)]);
    assert_eq!(returned(outcome), Value::Int32(1));
}

// ---------------------------------------------------------------------------
// Inline caches
// ---------------------------------------------------------------------------

#[test]
fn test_typed_array_ic_attaches_once() {
    let function = load_function();
    let mut heap = Heap::new();
    let typed = heap.new_typed_array(ObjectClass::Int32Array, 4).expect("typed array");
    heap.object_mut(typed).expect("typed array").elements[2] = Value::Int32(8).to_raw();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    assert_eq!(code.code().ics.len(), 1);

    let args = [Value::Object(typed), Value::Int32(2)];
    let (outcome, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Int32(8));
    assert_eq!(stats.ic_calls, 1);

    for _ in 0..5 {
        let (outcome, stats) = run(&mut heap, &code, &function, &args);
        assert_eq!(returned(outcome), Value::Int32(8));
        assert_eq!(stats.ic_calls, 0);
        assert_eq!(stats.ic_hits, 1);
    }
    let state = code.ic_state(IcId(0)).expect("ic");
    assert_eq!(state.stubs.len(), 1);
    assert_eq!(state.version, 1);
    assert_eq!(state.state(), IcState::Polymorphic);

    // Typed-array reads never consult the prototype.
    heap.set_array_proto_element(2, Value::Int32(99));
    let (outcome, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Int32(8));
    assert_eq!(stats.ic_hits, 1);
    assert_eq!(code.ic_state(IcId(0)).expect("ic").version, 1);
}

#[test]
fn test_dense_array_stays_on_inline_path() {
    let function = load_function();
    let mut heap = Heap::new();
    let arr = heap.new_array(&[Value::Int32(4), Value::Int32(5)]);
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());

    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(1)]);
    assert_eq!(returned(outcome), Value::Int32(5));
    assert_eq!(stats.ic_calls, 0);
    assert_eq!(stats.slow_steps, 0);

    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(2)]);
    assert_eq!(returned(outcome), Value::Undefined);
    assert_eq!(stats.ic_calls, 1);
    assert!(code.ic_state(IcId(0)).expect("ic").stubs.is_empty());
}

#[test]
fn test_named_slot_ic() {
    let function = load_function();
    let mut heap = Heap::new();
    let x = heap.intern("x");
    let obj = heap.new_object_with_keys(&[x]);
    heap.define_named(obj, x, Value::Int32(3)).expect("define");
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());

    let args = [Value::Object(obj), Value::String(x)];
    let (outcome, _) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Int32(3));
    heap.define_named(obj, x, Value::Int32(4)).expect("define");
    let (outcome, stats) = run(&mut heap, &code, &function, &args);
    assert_eq!(returned(outcome), Value::Int32(4));
    assert_eq!(stats.ic_hits, 1);
}

#[test]
fn test_ic_goes_megamorphic_past_cap() {
    let function = load_function();
    let mut heap = Heap::new();
    let ints = heap.new_typed_array(ObjectClass::Int32Array, 2).expect("typed array");
    let doubles = heap.new_typed_array(ObjectClass::Float64Array, 2).expect("typed array");
    let config = JitConfig {
        ic_max_stubs: 1,
        ..JitConfig::default()
    };
    let code = compile(&mut heap, &function, &NoTypeInfo, config);

    run(&mut heap, &code, &function, &[Value::Object(ints), Value::Int32(0)]);
    run(&mut heap, &code, &function, &[Value::Object(doubles), Value::Int32(0)]);
    let state = code.ic_state(IcId(0)).expect("ic");
    assert_eq!(state.state(), IcState::Megamorphic);

    let arr = heap.new_array(&[Value::Int32(6)]);
    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Object(arr), Value::Int32(0)]);
    assert_eq!(returned(outcome), Value::Int32(6));
    assert_eq!(stats.megamorphic_redirects, 1);
    assert_eq!(stats.ic_calls, 1);
}

#[test]
fn test_setelem_ic_writes_typed_array() {
    let function = store_function();
    let mut heap = Heap::new();
    let typed = heap.new_typed_array(ObjectClass::Float64Array, 3).expect("typed array");
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());

    for (index, value) in [(0, 1.5), (1, 2.5), (2, 3.5)] {
        let args = [Value::Object(typed), Value::Int32(index), Value::Double(value)];
        let (outcome, _) = run(&mut heap, &code, &function, &args);
        assert_eq!(returned(outcome), Value::Undefined);
    }
    let object = heap.object(typed).expect("typed array");
    assert_eq!(object.elements[2], Value::Double(3.5).to_raw());
    assert_eq!(code.ic_state(IcId(0)).expect("ic").stubs.len(), 1);
}

// ---------------------------------------------------------------------------
// Bailouts
// ---------------------------------------------------------------------------

#[test]
fn test_element_of_undefined_bails_out() {
    let function = load_function();
    let mut heap = Heap::new();
    let code = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
    let (outcome, stats) = run(&mut heap, &code, &function, &[Value::Undefined, Value::Int32(0)]);
    let ExecOutcome::Bailout(state) = outcome else {
        panic!("expected a bailout");
    };
    assert_eq!(state.pc, 2);
    assert_eq!(state.stack(2), &[Value::Undefined, Value::Int32(0)]);
    assert!(state.error.is_some());
    assert_eq!(stats.bailouts, 1);
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

fn array_literal(count: u32, inits: &[(i32, i32)], read: i32) -> Function {
    let mut instructions = vec![Instruction::NewArray { count }];
    for &(index, value) in inits {
        instructions.extend([
            Instruction::Int32 { value: index },
            Instruction::Int32 { value },
            Instruction::InitElem,
        ]);
    }
    instructions.extend([
        Instruction::EndInit,
        Instruction::Int32 { value: read },
        Instruction::GetElem,
        Instruction::Return,
    ]);
    FunctionBuilder::new().instructions(instructions).build()
}

#[test]
fn test_out_of_order_initializers_keep_the_initialized_length() {
    // The second store is inline and lower than what the first one covered.
    for (inits, read, expected) in [
        (&[(1, 7), (0, 6)][..], 1, Value::Int32(7)),
        (&[(5, 100), (0, 1)][..], 5, Value::Int32(100)),
        (&[(1, 7), (0, 6)][..], 0, Value::Int32(6)),
    ] {
        let function = array_literal(2, inits, read);
        let mut heap = Heap::new();
        let fast = compile(&mut heap, &function, &NoTypeInfo, JitConfig::default());
        let generic = compile(&mut heap, &function, &NoTypeInfo, JitConfig::generic());
        let (outcome, _) = run(&mut heap, &fast, &function, &[]);
        assert_eq!(returned(outcome), expected, "{inits:?} read {read}");
        let (outcome, _) = run(&mut heap, &generic, &function, &[]);
        assert_eq!(returned(outcome), expected, "{inits:?} read {read}, generic");
    }
}
