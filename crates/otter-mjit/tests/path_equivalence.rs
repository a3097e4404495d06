//! Fast paths and generic stubs must agree.
//!
//! Every program here is compiled three ways on the same heap: with no type
//! facts, with exact facts for the inputs, and with inline paths disabled.
//! All three must produce the same value.

use otter_mjit::{
    CompileEnv, ExecOutcome, JitCompiler, JitConfig, Machine, NoHoisting, NoTypeInfo, ObjectKind, OracleTable,
    TypeFlags, TypeOracle, TypeSet,
};
use otter_mjit_bytecode::{ArgIndex, Function, FunctionBuilder, Instruction, JumpOffset, LocalIndex};
use otter_mjit_runtime::{Heap, ObjId, RawValue, Tag, Value};
use proptest::prelude::*;

/// Heap-independent description of an argument
#[derive(Debug, Clone)]
enum Input {
    Int(i32),
    Num(f64),
    Bool(bool),
    Null,
    Undefined,
    Str(&'static str),
}

impl Input {
    fn materialize(&self, heap: &mut Heap) -> Value {
        match *self {
            Input::Int(i) => Value::Int32(i),
            Input::Num(d) => Value::Double(d),
            Input::Bool(b) => Value::Boolean(b),
            Input::Null => Value::Null,
            Input::Undefined => Value::Undefined,
            Input::Str(s) => Value::String(heap.intern(s)),
        }
    }
}

fn flags_of(value: Value) -> TypeFlags {
    match value.tag() {
        Tag::Int32 => TypeFlags::INT32,
        Tag::Double => TypeFlags::DOUBLE,
        Tag::Boolean => TypeFlags::BOOLEAN,
        Tag::Null => TypeFlags::NULL,
        Tag::Undefined => TypeFlags::UNDEFINED,
        Tag::String => TypeFlags::STRING,
        Tag::Object => TypeFlags::OBJECT,
        Tag::Magic => TypeFlags::empty(),
    }
}

fn number() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(0.0),
        Just(-0.0),
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(2147483648.0),
        Just(-2147483649.0),
        Just(4294967296.0 + 7.0),
        Just(1e20),
        (-1000i32..1000).prop_map(|i| i as f64),
        (-1e6f64..1e6),
    ]
}

fn input() -> impl Strategy<Value = Input> {
    prop_oneof![
        4 => prop_oneof![
            Just(0),
            Just(1),
            Just(-1),
            Just(31),
            Just(32),
            Just(i32::MAX),
            Just(i32::MIN),
            any::<i32>(),
        ]
        .prop_map(Input::Int),
        3 => number().prop_map(Input::Num),
        1 => any::<bool>().prop_map(Input::Bool),
        1 => Just(Input::Null),
        1 => Just(Input::Undefined),
        1 => prop::sample::select(vec!["", "5", "-3", "abc", "1e3", " 12 "]).prop_map(Input::Str),
    ]
}

fn binary_op() -> impl Strategy<Value = Instruction> {
    prop::sample::select(vec![
        Instruction::Add,
        Instruction::Sub,
        Instruction::BitOr,
        Instruction::BitAnd,
        Instruction::BitXor,
        Instruction::Lsh,
        Instruction::Rsh,
        Instruction::Ursh,
        Instruction::Eq,
        Instruction::Ne,
        Instruction::StrictEq,
        Instruction::StrictNe,
        Instruction::Lt,
        Instruction::Le,
        Instruction::Gt,
        Instruction::Ge,
    ])
}

fn relational_op() -> impl Strategy<Value = Instruction> {
    prop::sample::select(vec![
        Instruction::Eq,
        Instruction::Ne,
        Instruction::StrictEq,
        Instruction::StrictNe,
        Instruction::Lt,
        Instruction::Le,
        Instruction::Gt,
        Instruction::Ge,
    ])
}

fn arg(idx: u16) -> Instruction {
    Instruction::GetArg { idx: ArgIndex(idx) }
}

/// Run `function` compiled three ways and return the three results
fn run_three_ways(heap: &mut Heap, function: &Function, exact: &OracleTable, args: &[Value]) -> [Value; 3] {
    heap.link_function(function);
    let plans: [(&dyn TypeOracle, JitConfig); 3] = [
        (&NoTypeInfo, JitConfig::default()),
        (exact, JitConfig::default()),
        (&NoTypeInfo, JitConfig::generic()),
    ];
    plans.map(|(oracle, config)| {
        let mut hoister = NoHoisting;
        let code = JitCompiler::new(config)
            .compile_and_publish(
                function,
                CompileEnv {
                    heap: &*heap,
                    oracle,
                    hoister: &mut hoister,
                },
            )
            .expect("compiles");
        let mut machine = Machine::with_config(heap, config);
        match machine.run(&code, function, args).expect("runs") {
            ExecOutcome::Return(value) => value,
            ExecOutcome::Bailout(state) => panic!("unexpected bailout: {state:?}"),
        }
    })
}

/// Visible state of an array: length and the initialized prefix, holes as `None`
type ArrayState = (u32, Vec<Option<Value>>);

fn array_state(heap: &Heap, id: ObjId) -> ArrayState {
    let object = heap.object(id).expect("array");
    let elements = object.elements[..object.initialized_length as usize]
        .iter()
        .map(|raw| (!raw.is_hole()).then(|| raw.decode().expect("element")))
        .collect();
    (object.length, elements)
}

/// Like [`run_three_ways`], with a fresh array built by `setup` for each run;
/// returns each result with the array as the run left it
fn run_three_ways_on_array(
    heap: &mut Heap,
    function: &Function,
    exact: &OracleTable,
    setup: impl Fn(&mut Heap) -> (ObjId, Vec<Value>),
) -> [(Value, ArrayState); 3] {
    heap.link_function(function);
    let plans: [(&dyn TypeOracle, JitConfig); 3] = [
        (&NoTypeInfo, JitConfig::default()),
        (exact, JitConfig::default()),
        (&NoTypeInfo, JitConfig::generic()),
    ];
    plans.map(|(oracle, config)| {
        let (arr, args) = setup(heap);
        let mut hoister = NoHoisting;
        let code = JitCompiler::new(config)
            .compile_and_publish(
                function,
                CompileEnv {
                    heap: &*heap,
                    oracle,
                    hoister: &mut hoister,
                },
            )
            .expect("compiles");
        let mut machine = Machine::with_config(heap, config);
        let value = match machine.run(&code, function, &args).expect("runs") {
            ExecOutcome::Return(value) => value,
            ExecOutcome::Bailout(state) => panic!("unexpected bailout: {state:?}"),
        };
        (value, array_state(heap, arr))
    })
}

fn exact_args(args: &[Value]) -> OracleTable {
    args.iter()
        .enumerate()
        .fold(OracleTable::new(), |table, (i, v)| table.with_arg(i as u16, TypeSet::of(flags_of(*v))))
}

fn assert_agree(results: [Value; 3]) -> Result<(), TestCaseError> {
    let [untyped, typed, generic] = results;
    prop_assert!(untyped.same_value(&generic), "untyped {untyped:?} vs generic {generic:?}");
    prop_assert!(typed.same_value(&generic), "typed {typed:?} vs generic {generic:?}");
    Ok(())
}

fn assert_arrays_agree(results: [(Value, ArrayState); 3]) -> Result<(), TestCaseError> {
    let [(untyped, untyped_array), (typed, typed_array), (generic, generic_array)] = results;
    assert_agree([untyped, typed, generic])?;
    prop_assert!(same_array(&untyped_array, &generic_array), "untyped {untyped_array:?} vs generic {generic_array:?}");
    prop_assert!(same_array(&typed_array, &generic_array), "typed {typed_array:?} vs generic {generic_array:?}");
    Ok(())
}

fn same_array((len_a, a): &ArrayState, (len_b, b): &ArrayState) -> bool {
    len_a == len_b
        && a.len() == b.len()
        && a.iter().zip(b).all(|pair| match pair {
            (Some(x), Some(y)) => x.same_value(y),
            (None, None) => true,
            _ => false,
        })
}

fn unary_op() -> impl Strategy<Value = Instruction> {
    prop::sample::select(vec![Instruction::Not, Instruction::BitNot, Instruction::Pos, Instruction::TypeOf])
}

fn type_name() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["number", "string", "undefined", "object", "boolean", "function", "bogus"])
}

/// A dense array with holes where `elements` has `None`
fn holey_array(heap: &mut Heap, elements: &[Option<i32>], extra: u32) -> ObjId {
    let values: Vec<Value> = elements.iter().map(|e| Value::Int32(e.unwrap_or(0))).collect();
    let arr = heap.new_array_with_capacity(&values, values.len() as u32 + extra);
    let object = heap.object_mut(arr).expect("array");
    for (slot, element) in object.elements.iter_mut().zip(elements) {
        if element.is_none() {
            *slot = RawValue::HOLE;
        }
    }
    arr
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn binary_ops_agree(op in binary_op(), lhs in input(), rhs in input()) {
        let function = FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![arg(0), arg(1), op, Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let args = [lhs.materialize(&mut heap), rhs.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn constant_operands_agree(op in binary_op(), lhs in input(), rhs in -40i32..40) {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![arg(0), Instruction::Int32 { value: rhs }, op, Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let args = [lhs.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn fused_branches_agree(op in relational_op(), lhs in input(), rhs in input(), jump_if in any::<bool>()) {
        let offset = JumpOffset(3);
        let branch = if jump_if {
            Instruction::IfNe { offset }
        } else {
            Instruction::IfEq { offset }
        };
        let function = FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![
                arg(0),
                arg(1),
                op,
                branch,
                Instruction::Int32 { value: 1 },
                Instruction::Return,
                Instruction::Int32 { value: 0 },
                Instruction::Return,
            ])
            .build();
        let mut heap = Heap::new();
        let args = [lhs.materialize(&mut heap), rhs.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn incdec_agrees(start in input(), post in any::<bool>(), dec in any::<bool>()) {
        let local = LocalIndex(0);
        let step = match (post, dec) {
            (false, false) => Instruction::IncLocal { idx: local },
            (false, true) => Instruction::DecLocal { idx: local },
            (true, false) => Instruction::LocalInc { idx: local },
            (true, true) => Instruction::LocalDec { idx: local },
        };
        // Result and final local value both feed the return.
        let function = FunctionBuilder::new()
            .param_count(1)
            .local_count(1)
            .instructions(vec![
                arg(0),
                Instruction::SetLocal { idx: local },
                Instruction::Pop,
                step,
                Instruction::GetLocal { idx: local },
                Instruction::Sub,
                Instruction::Return,
            ])
            .build();
        let mut heap = Heap::new();
        let args = [start.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn dense_reads_agree(
        elements in prop::collection::vec(prop::option::weighted(0.8, any::<i32>()), 0..8),
        extra in 0u32..4,
        index in -2i32..12,
        packed in any::<bool>(),
    ) {
        let function = FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![arg(0), arg(1), Instruction::GetElem, Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let arr = holey_array(&mut heap, &elements, extra);
        let args = [Value::Object(arr), Value::Int32(index)];
        // A packed claim may be stale: holes must still read correctly.
        let kind = if packed { ObjectKind::PackedArray } else { ObjectKind::DenseArray };
        let exact = OracleTable::new()
            .with_arg(0, TypeSet::objects(kind))
            .with_arg(1, TypeSet::of(TypeFlags::INT32));
        let results = run_three_ways(&mut heap, &function, &exact, &args);
        assert_agree(results)?;
    }

    #[test]
    fn dense_writes_agree(
        elements in prop::collection::vec(prop::option::weighted(0.8, any::<i32>()), 0..6),
        extra in 0u32..3,
        index in -1i32..10,
        value in input(),
        read in 0i32..10,
    ) {
        // Store, then read one element back.
        let function = FunctionBuilder::new()
            .param_count(4)
            .instructions(vec![
                arg(0),
                arg(1),
                arg(2),
                Instruction::SetElem,
                Instruction::Pop,
                arg(0),
                arg(3),
                Instruction::GetElem,
                Instruction::Return,
            ])
            .build();
        let mut heap = Heap::new();
        let stored = value.materialize(&mut heap);
        let exact = OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32))
            .with_arg(2, TypeSet::of(flags_of(stored)))
            .with_arg(3, TypeSet::of(TypeFlags::INT32));
        let results = run_three_ways_on_array(&mut heap, &function, &exact, |heap| {
            let arr = holey_array(heap, &elements, extra);
            (arr, vec![Value::Object(arr), Value::Int32(index), stored, Value::Int32(read)])
        });
        assert_arrays_agree(results)?;
    }

    #[test]
    fn unary_ops_agree(op in unary_op(), x in input()) {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![arg(0), op, Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let args = [x.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn typeof_comparisons_agree(x in input(), name in type_name(), strict in any::<bool>(), branch in any::<bool>()) {
        let mut builder = FunctionBuilder::new();
        let idx = builder.string(name);
        let compare = if strict { Instruction::StrictEq } else { Instruction::Eq };
        let mut instructions = vec![arg(0), Instruction::TypeOf, Instruction::String { idx }, compare];
        if branch {
            instructions.extend([
                Instruction::IfEq { offset: JumpOffset(3) },
                Instruction::Int32 { value: 1 },
                Instruction::Return,
                Instruction::Int32 { value: 0 },
            ]);
        }
        instructions.push(Instruction::Return);
        let function = builder.param_count(1).instructions(instructions).build();
        let mut heap = Heap::new();
        let args = [x.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn short_circuits_agree(lhs in input(), rhs in input(), or in any::<bool>()) {
        let offset = JumpOffset(2);
        let op = if or { Instruction::Or { offset } } else { Instruction::And { offset } };
        let function = FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![arg(0), op, arg(1), Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let args = [lhs.materialize(&mut heap), rhs.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn truthiness_branches_agree(x in input(), jump_if in any::<bool>()) {
        let offset = JumpOffset(3);
        let branch = if jump_if { Instruction::IfNe { offset } } else { Instruction::IfEq { offset } };
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![
                arg(0),
                branch,
                Instruction::Int32 { value: 1 },
                Instruction::Return,
                Instruction::Int32 { value: 0 },
                Instruction::Return,
            ])
            .build();
        let mut heap = Heap::new();
        let args = [x.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn arg_incdec_agrees(start in input(), post in any::<bool>(), dec in any::<bool>()) {
        let idx = ArgIndex(0);
        let step = match (post, dec) {
            (false, false) => Instruction::IncArg { idx },
            (false, true) => Instruction::DecArg { idx },
            (true, false) => Instruction::ArgInc { idx },
            (true, true) => Instruction::ArgDec { idx },
        };
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![step, arg(0), Instruction::Sub, Instruction::Return])
            .build();
        let mut heap = Heap::new();
        let args = [start.materialize(&mut heap)];
        let results = run_three_ways(&mut heap, &function, &exact_args(&args), &args);
        assert_agree(results)?;
    }

    #[test]
    fn array_literals_agree(
        count in 0u32..5,
        inits in prop::collection::vec((0i32..7, any::<i32>()), 0..6),
        read in 0i32..8,
    ) {
        let mut builder = FunctionBuilder::new();
        let length = builder.string("length");
        let mut instructions = vec![Instruction::NewArray { count }];
        for &(index, value) in &inits {
            instructions.extend([
                Instruction::Int32 { value: index },
                Instruction::Int32 { value },
                Instruction::InitElem,
            ]);
        }
        instructions.extend([
            Instruction::EndInit,
            Instruction::Dup,
            Instruction::SetLocal { idx: LocalIndex(0) },
            Instruction::Pop,
            Instruction::Int32 { value: read },
            Instruction::GetElem,
            Instruction::GetLocal { idx: LocalIndex(0) },
            Instruction::String { idx: length },
            Instruction::GetElem,
            Instruction::Sub,
            Instruction::Return,
        ]);
        let function = builder.local_count(1).instructions(instructions).build();
        let mut heap = Heap::new();
        let results = run_three_ways(&mut heap, &function, &OracleTable::new(), &[]);
        assert_agree(results)?;
    }

    #[test]
    fn object_literals_agree(
        names in prop::collection::vec(0usize..3, 0..5),
        read in 0usize..3,
    ) {
        const NAMES: [&str; 3] = ["a", "b", "c"];
        let mut builder = FunctionBuilder::new();
        let template = builder.template(&NAMES[..2]);
        let keys: Vec<_> = NAMES.iter().map(|name| builder.string(name)).collect();
        let mut instructions = vec![Instruction::NewObject { template }];
        for (i, &name) in names.iter().enumerate() {
            instructions.extend([Instruction::Int32 { value: i as i32 + 1 }, Instruction::InitProp { name: keys[name] }]);
        }
        instructions.extend([
            Instruction::EndInit,
            Instruction::String { idx: keys[read] },
            Instruction::GetElem,
            Instruction::Return,
        ]);
        let function = builder.instructions(instructions).build();
        let mut heap = Heap::new();
        let results = run_three_ways(&mut heap, &function, &OracleTable::new(), &[]);
        assert_agree(results)?;
    }
}
