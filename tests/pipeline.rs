//! End-to-end scenarios: build IR through the public builder surface, run
//! the full middle and backend pipeline, execute the result in the host
//! VM, and read globals back by name.

use fxc::{
    middle::{
        builder::{Builder, DeclKeywords, Place},
        ty::{BinOp, ValueType},
    },
    vm::{Fault, Vm},
    Options,
};

fn build(construct: impl FnOnce(&mut Builder)) -> Vm<'static> {
    let mut vm = try_build(construct, &Options::default()).unwrap();
    vm.run("init").unwrap();
    vm
}

fn try_build(
    construct: impl FnOnce(&mut Builder),
    options: &Options,
) -> fxc::Result<Vm<'static>> {
    let mut builder = Builder::new("scenario");
    construct(&mut builder);
    let program = builder.finish()?;
    let mut compiled = fxc::compile(program, options)?;
    let artifact = fxc::generate(&mut compiled, options)?;
    Ok(Vm::new(&artifact))
}

fn global_i32(b: &mut Builder, name: &str) -> fxc::Result<fxc::middle::var::VarId> {
    b.declare_var(name, ValueType::I32, DeclKeywords::default(), true)
}

#[test]
fn straight_line_constant_sums() {
    let vm = build(|b| {
        let a = global_i32(b, "a").unwrap();
        let bb = global_i32(b, "b").unwrap();
        let c = global_i32(b, "c").unwrap();
        b.begin_function("init", &[], None).unwrap();

        let one = b.add_const_i32(1);
        let two = b.add_const_i32(2);
        let sum = b.binop(BinOp::Add, one, two).unwrap();
        b.assign(Place::Direct(a), sum).unwrap();

        let three = b.add_const_i32(3);
        let a_val = b.get_var("a").unwrap();
        let sum = b.binop(BinOp::Add, three, a_val).unwrap();
        b.assign(Place::Direct(bb), sum).unwrap();

        let b_val = b.get_var("b").unwrap();
        let a_val = b.get_var("a").unwrap();
        let sum = b.binop(BinOp::Add, b_val, a_val).unwrap();
        b.assign(Place::Direct(c), sum).unwrap();

        b.end_function().unwrap();
    });

    assert_eq!(vm.global("a"), Some(3));
    assert_eq!(vm.global("b"), Some(6));
    assert_eq!(vm.global("c"), Some(9));
}

#[test]
fn counted_for_loop() {
    let vm = build(|b| {
        let a = global_i32(b, "a").unwrap();
        b.begin_function("init", &[], None).unwrap();

        let limit = b.add_const_i32(10);
        b.begin_for("i", limit).unwrap();
        let one = b.add_const_i32(1);
        b.augassign(Place::Direct(a), BinOp::Add, one).unwrap();
        b.end_for().unwrap();

        b.end_function().unwrap();
    });

    assert_eq!(vm.global("a"), Some(10));
}

#[test]
fn while_loop_with_two_counters() {
    let vm = build(|b| {
        let a = global_i32(b, "a").unwrap();
        let i = global_i32(b, "i").unwrap();
        b.begin_function("init", &[], None).unwrap();

        b.begin_while().unwrap();
        let i_val = b.get_var("i").unwrap();
        let ten = b.add_const_i32(10);
        let cond = b.binop(BinOp::Lt, i_val, ten).unwrap();
        b.test_while(cond).unwrap();
        let one = b.add_const_i32(1);
        b.augassign(Place::Direct(a), BinOp::Add, one).unwrap();
        let one = b.add_const_i32(1);
        b.augassign(Place::Direct(i), BinOp::Add, one).unwrap();
        b.end_while().unwrap();

        b.end_function().unwrap();
    });

    assert_eq!(vm.global("a"), Some(10));
    assert_eq!(vm.global("i"), Some(10));
}

#[test]
fn runtime_division_by_zero_saturates() {
    let vm = build(|b| {
        let a = global_i32(b, "a").unwrap();
        global_i32(b, "zero").unwrap();
        b.begin_function("init", &[], None).unwrap();

        let lhs = b.add_const_i32(123);
        let rhs = b.get_var("zero").unwrap();
        let quotient = b.binop(BinOp::Div, lhs, rhs).unwrap();
        b.assign(Place::Direct(a), quotient).unwrap();

        b.end_function().unwrap();
    });

    assert_eq!(vm.global("a"), Some(0));
}

#[test]
fn nested_loop_with_inner_break() {
    let vm = build(|b| {
        let outer = global_i32(b, "outer").unwrap();
        let n = global_i32(b, "n").unwrap();
        b.begin_function("init", &[], None).unwrap();
        let j = b
            .declare_var("j", ValueType::I32, DeclKeywords::default(), false)
            .unwrap();

        let four = b.add_const_i32(4);
        b.begin_for("i", four).unwrap();
        {
            let one = b.add_const_i32(1);
            b.augassign(Place::Direct(outer), BinOp::Add, one).unwrap();

            let zero = b.add_const_i32(0);
            b.assign(Place::Direct(j), zero).unwrap();
            b.begin_while().unwrap();
            let always = b.add_const_i32(1);
            b.test_while(always).unwrap();
            let one = b.add_const_i32(1);
            b.augassign(Place::Direct(j), BinOp::Add, one).unwrap();
            let j_val = b.get_var("j").unwrap();
            let five = b.add_const_i32(5);
            let done = b.binop(BinOp::Gt, j_val, five).unwrap();
            b.ifelse(done).unwrap();
            b.loop_break().unwrap();
            b.end_if().unwrap();
            b.end_ifelse().unwrap();
            b.end_while().unwrap();

            let j_val = b.get_var("j").unwrap();
            b.assign(Place::Direct(n), j_val).unwrap();
        }
        b.end_for().unwrap();

        b.end_function().unwrap();
    });

    assert_eq!(vm.global("outer"), Some(4));
    assert_eq!(vm.global("n"), Some(6));
}

#[test]
fn fixed_point_literal_round_trips() {
    let vm = build(|b| {
        let a = b
            .declare_var("a", ValueType::F16, DeclKeywords::default(), true)
            .unwrap();
        b.begin_function("init", &[], None).unwrap();
        let literal = b.add_const_f16(123.456);
        b.assign(Place::Direct(a), literal).unwrap();
        b.end_function().unwrap();
    });

    let raw = vm.global("a").unwrap();
    assert_eq!(raw, (123.456f64 * 65536.0) as i32);
    assert!((f64::from(raw) / 65536.0 - 123.456).abs() < 1e-4);
}

#[test]
fn helper_functions_run_through_call_and_return() {
    let mut vm = try_build(
        |b| {
            let out = global_i32(b, "out").unwrap();

            b.begin_function(
                "add",
                &[("x", ValueType::I32), ("y", ValueType::I32)],
                Some(ValueType::I32),
            )
            .unwrap();
            let x = b.get_var("x").unwrap();
            let y = b.get_var("y").unwrap();
            let sum = b.binop(BinOp::Add, x, y).unwrap();
            b.fn_return(Some(sum)).unwrap();
            b.end_function().unwrap();

            b.begin_function("init", &[], None).unwrap();
            let twenty = b.add_const_i32(20);
            let twentytwo = b.add_const_i32(22);
            let result = b.call("add", &[twenty, twentytwo]).unwrap().unwrap();
            b.assign(Place::Direct(out), result).unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    vm.run("init").unwrap();
    assert_eq!(vm.global("out"), Some(42));
}

#[test]
fn loop_entry_point_accumulates_across_invocations() {
    let mut vm = try_build(
        |b| {
            let ticks = global_i32(b, "ticks").unwrap();
            b.begin_function("init", &[], None).unwrap();
            b.end_function().unwrap();

            b.begin_function("loop", &[], None).unwrap();
            let one = b.add_const_i32(1);
            b.augassign(Place::Direct(ticks), BinOp::Add, one).unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    vm.run("init").unwrap();
    vm.run("loop").unwrap();
    vm.run("loop").unwrap();
    assert_eq!(vm.global("ticks"), Some(2));
}

#[test]
fn library_calls_reach_host_handlers() {
    let mut vm = try_build(
        |b| {
            let out = global_i32(b, "out").unwrap();
            b.begin_function("init", &[], None).unwrap();
            let bound = b.add_const_i32(100);
            let value = b.call("rand", &[bound]).unwrap().unwrap();
            b.assign(Place::Direct(out), value).unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    vm.link("rand", |bound, _| bound - 1);
    vm.run("init").unwrap();
    assert_eq!(vm.global("out"), Some(99));
}

#[test]
fn an_unbounded_loop_hits_the_cycle_budget() {
    let mut vm = try_build(
        |b| {
            b.begin_function("init", &[], None).unwrap();
            b.begin_while().unwrap();
            let always = b.add_const_i32(1);
            b.test_while(always).unwrap();
            b.end_while().unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    assert_eq!(vm.run("init"), Err(Fault::CycleLimit));
}

#[test]
fn failed_assertions_halt_the_function() {
    let mut vm = try_build(
        |b| {
            global_i32(b, "flag").unwrap();
            b.begin_function("init", &[], None).unwrap();
            let flag = b.get_var("flag").unwrap();
            b.assertion(flag).unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    let fault = vm.run("init").unwrap_err();
    assert!(matches!(fault, Fault::Assertion { .. }));
    assert!(fault.is_fatal());
}

#[test]
fn register_exhaustion_is_fatal() {
    let options = Options {
        function_registers: 2,
        ..Options::default()
    };
    let error = try_build(
        |b| {
            b.begin_function("init", &[], Some(ValueType::I32)).unwrap();
            let x = b.call("rand", &[]).unwrap().unwrap();
            let y = b.call("rand", &[]).unwrap().unwrap();
            let z = b.call("rand", &[]).unwrap().unwrap();
            let sum = b.binop(BinOp::Add, x, y).unwrap();
            let sum = b.binop(BinOp::Add, sum, z).unwrap();
            b.fn_return(Some(sum)).unwrap();
            b.end_function().unwrap();
        },
        &options,
    )
    .err()
    .unwrap();

    assert!(error.is_internal());
}

#[test]
fn a_zero_iteration_cap_trips_the_guard_instead_of_hanging() {
    let options = Options {
        fixed_point_iteration_limit: 0,
        ..Options::default()
    };
    let error = try_build(
        |b| {
            let a = global_i32(b, "a").unwrap();
            b.begin_function("init", &[], None).unwrap();
            let one = b.add_const_i32(1);
            b.assign(Place::Direct(a), one).unwrap();
            b.end_function().unwrap();
        },
        &options,
    )
    .err()
    .unwrap();

    assert!(error.is_internal());
}

#[test]
fn conditionally_reassigned_parameters_keep_the_incoming_value() {
    let vm = build(|b| {
        let skipped = global_i32(b, "skipped").unwrap();
        let taken = global_i32(b, "taken").unwrap();

        b.begin_function("bump", &[("x", ValueType::I32)], Some(ValueType::I32))
            .unwrap();
        let x = b.get_var("x").unwrap();
        b.ifelse(x).unwrap();
        let five = b.add_const_i32(5);
        b.assign(Place::Direct(x), five).unwrap();
        b.end_if().unwrap();
        b.end_ifelse().unwrap();
        let x_val = b.get_var("x").unwrap();
        let one = b.add_const_i32(1);
        let sum = b.binop(BinOp::Add, x_val, one).unwrap();
        b.fn_return(Some(sum)).unwrap();
        b.end_function().unwrap();

        b.begin_function("init", &[], None).unwrap();
        let zero = b.add_const_i32(0);
        let result = b.call("bump", &[zero]).unwrap().unwrap();
        b.assign(Place::Direct(skipped), result).unwrap();
        let three = b.add_const_i32(3);
        let result = b.call("bump", &[three]).unwrap().unwrap();
        b.assign(Place::Direct(taken), result).unwrap();
        b.end_function().unwrap();
    });

    // Zero bypasses the reassignment; a nonzero argument takes it
    assert_eq!(vm.global("skipped"), Some(1));
    assert_eq!(vm.global("taken"), Some(6));
}

#[test]
fn parameters_reassigned_from_library_calls() {
    let mut vm = try_build(
        |b| {
            let out = global_i32(b, "out").unwrap();

            b.begin_function("bump", &[("x", ValueType::I32)], Some(ValueType::I32))
                .unwrap();
            let x = b.get_var("x").unwrap();
            let doubled = b.call("double", &[x]).unwrap().unwrap();
            b.assign(Place::Direct(x), doubled).unwrap();
            let x_val = b.get_var("x").unwrap();
            b.fn_return(Some(x_val)).unwrap();
            b.end_function().unwrap();

            b.begin_function("init", &[], None).unwrap();
            let arg = b.add_const_i32(21);
            let result = b.call("bump", &[arg]).unwrap().unwrap();
            b.assign(Place::Direct(out), result).unwrap();
            b.end_function().unwrap();
        },
        &Options::default(),
    )
    .unwrap();

    vm.link("double", |value, _| value * 2);
    vm.run("init").unwrap();
    assert_eq!(vm.global("out"), Some(42));
}
