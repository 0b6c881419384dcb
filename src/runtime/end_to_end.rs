//! Compile resolved programs and execute them, with and without the
//! peephole pass.

use crate::bytecode::compile::compile;
use crate::bytecode::ir::CompiledProgram;
use crate::bytecode::stack_check::check_function;
use crate::config::CodegenConfig;
use crate::lang::node::{BinaryOp, CompareOp, Expr, ExprKind, IfArm, Stmt, UnaryOp};
use crate::lang::program::{FieldDef, GlobalId, Program, StructDef, StructId};
use crate::lang::types::{IntType, Param, Type};
use crate::runtime::{RuntimeError, Vm, VmConfig};

fn i64_ty() -> Type {
    Type::Int(IntType::I64)
}

fn lit(value: i64) -> Expr {
    Expr::i64(value)
}

fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Add, lhs, rhs)
}

fn mul(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Mul, lhs, rhs)
}

fn cmp(op: CompareOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::compare(op, lhs, rhs)
}

fn build(program: &Program, config: CodegenConfig) -> CompiledProgram {
    match compile(program, config) {
        Ok(compiled) => compiled.program,
        Err(diagnostics) => panic!("{}", diagnostics),
    }
}

/// Every function must be stack-balanced; the top level ends one slot up.
fn check_stack(program: &CompiledProgram) {
    let debug = program.debug.as_ref().expect("debug info");
    for function in &debug.functions {
        let expected = if function.start == program.entry { 8 } else { 0 };
        assert_eq!(
            check_function(&program.instructions, function.start..function.end),
            Ok(expected),
            "stack check of '{}'",
            function.name
        );
    }
}

fn execute(program: &Program, optimize: bool) -> Result<i64, RuntimeError> {
    let compiled = build(
        program,
        CodegenConfig {
            optimize,
            ..CodegenConfig::default()
        },
    );
    check_stack(&compiled);
    Vm::new().run_program(&compiled)
}

/// Run optimized and unoptimized code; both must agree.
fn run(program: &Program) -> i64 {
    let optimized = execute(program, true);
    let plain = execute(program, false);
    assert_eq!(optimized, plain, "optimized and plain runs differ");
    optimized.unwrap_or_else(|e| panic!("runtime error: {}", e))
}

/// `struct S { tag: i64 }` whose destructor appends the tag to the decimal
/// digits of the global `log`.
fn tagged_struct(p: &mut Program) -> (StructId, GlobalId) {
    let log = p.add_global("log", i64_ty(), Some(lit(0)));
    let s = p.add_struct(StructDef {
        name: "S".to_string(),
        fields: vec![FieldDef {
            name: "tag".to_string(),
            ty: i64_ty(),
            offset: 0,
        }],
        size: 8,
        destructor: None,
        deallocator: None,
    });
    let ptr = Type::pointer_to(Type::Struct(s));
    let drop = p.declare_function("drop_s", vec![Param::new("p", ptr.clone())], Type::Void);
    let log_var = Expr::global(log, i64_ty());
    let tag = Expr::field(Expr::deref(Expr::param(0, ptr)), 0, i64_ty());
    p.define_function(
        drop,
        vec![Stmt::assign(log_var.clone(), add(mul(log_var, lit(10)), tag))],
    );
    p.structs[s.0 as usize].destructor = Some(drop);
    (s, log)
}

fn tag_of(var: Expr) -> Expr {
    Expr::field(var, 0, i64_ty())
}

#[test]
fn test_if_return() {
    let mut p = Program::new();
    p.push_main(Stmt::if_(
        cmp(CompareOp::Lt, lit(1), lit(2)),
        vec![Stmt::ret(Some(lit(1)))],
        None,
    ));
    p.push_main(Stmt::ret(Some(lit(0))));
    assert_eq!(run(&p), 1);
}

#[test]
fn test_no_return_exits_zero() {
    let mut p = Program::new();
    p.push_main(Stmt::expr(add(lit(1), lit(2))));
    assert_eq!(run(&p), 0);
}

#[test]
fn test_counter_loop() {
    let mut p = Program::new();
    let i = p.add_local("i", i64_ty());
    let var = move || Expr::local(i, i64_ty());
    p.push_main(Stmt::let_(i, Some(lit(0))));
    p.push_main(Stmt::while_(
        cmp(CompareOp::Lt, var(), lit(3)),
        vec![Stmt::assign(var(), add(var(), lit(1)))],
    ));
    p.push_main(Stmt::ret(Some(var())));
    assert_eq!(run(&p), 3);
}

#[test]
fn test_for_with_continue_and_break() {
    let mut p = Program::new();
    let sum = p.add_local("sum", i64_ty());
    let i = p.add_local("i", i64_ty());
    let s = move || Expr::local(sum, i64_ty());
    let v = move || Expr::local(i, i64_ty());

    p.push_main(Stmt::let_(sum, Some(lit(0))));
    p.push_main(Stmt::for_(
        Some(Stmt::let_(i, Some(lit(0)))),
        Some(cmp(CompareOp::Lt, v(), lit(10))),
        Some(Stmt::assign(v(), add(v(), lit(1)))),
        vec![
            Stmt::if_(cmp(CompareOp::Eq, v(), lit(5)), vec![Stmt::cont()], None),
            Stmt::if_(cmp(CompareOp::Eq, v(), lit(8)), vec![Stmt::brk()], None),
            Stmt::assign(s(), add(s(), v())),
        ],
    ));
    p.push_main(Stmt::ret(Some(s())));
    assert_eq!(run(&p), 1 + 2 + 3 + 4 + 6 + 7);
}

#[test]
fn test_else_if_chain() {
    let mut p = Program::new();
    let x = p.add_local("x", i64_ty());
    let r = p.add_local("r", i64_ty());
    let xv = move || Expr::local(x, i64_ty());
    let rv = move || Expr::local(r, i64_ty());

    p.push_main(Stmt::let_(x, Some(lit(7))));
    p.push_main(Stmt::let_(r, None));
    p.push_main(Stmt::if_chain(
        vec![
            IfArm {
                cond: cmp(CompareOp::Lt, xv(), lit(5)),
                body: vec![Stmt::assign(rv(), lit(1))],
            },
            IfArm {
                cond: cmp(CompareOp::Lt, xv(), lit(10)),
                body: vec![Stmt::assign(rv(), lit(2))],
            },
        ],
        Some(vec![Stmt::assign(rv(), lit(3))]),
    ));
    p.push_main(Stmt::ret(Some(rv())));
    assert_eq!(run(&p), 2);
}

#[test]
fn test_destructors_run_in_reverse_order() {
    let mut p = Program::new();
    let (s, log) = tagged_struct(&mut p);
    let a = p.add_local("a", Type::Struct(s));
    let b = p.add_local("b", Type::Struct(s));

    p.push_main(Stmt::block(vec![
        Stmt::let_(a, None),
        Stmt::assign(tag_of(Expr::local(a, Type::Struct(s))), lit(1)),
        Stmt::let_(b, None),
        Stmt::assign(tag_of(Expr::local(b, Type::Struct(s))), lit(2)),
    ]));
    p.push_main(Stmt::ret(Some(Expr::global(log, i64_ty()))));
    assert_eq!(run(&p), 21);
}

#[test]
fn test_break_destroys_loop_locals() {
    let mut p = Program::new();
    let (s, log) = tagged_struct(&mut p);
    let i = p.add_local("i", i64_ty());
    let obj = p.add_local("obj", Type::Struct(s));
    let v = move || Expr::local(i, i64_ty());

    p.push_main(Stmt::for_(
        Some(Stmt::let_(i, Some(lit(0)))),
        Some(cmp(CompareOp::Lt, v(), lit(5))),
        Some(Stmt::assign(v(), add(v(), lit(1)))),
        vec![
            Stmt::let_(obj, None),
            Stmt::assign(tag_of(Expr::local(obj, Type::Struct(s))), add(v(), lit(1))),
            Stmt::if_(cmp(CompareOp::Eq, v(), lit(2)), vec![Stmt::brk()], None),
        ],
    ));
    p.push_main(Stmt::ret(Some(Expr::global(log, i64_ty()))));
    assert_eq!(run(&p), 123);
}

#[test]
fn test_return_destroys_every_open_scope() {
    let mut p = Program::new();
    let (s, log) = tagged_struct(&mut p);
    let outer = p.add_local("outer", Type::Struct(s));
    let inner = p.add_local("inner", Type::Struct(s));
    let r = p.add_local("r", i64_ty());

    let f = p.declare_function("f", vec![], i64_ty());
    p.define_function(
        f,
        vec![
            Stmt::let_(outer, None),
            Stmt::assign(tag_of(Expr::local(outer, Type::Struct(s))), lit(4)),
            Stmt::block(vec![
                Stmt::let_(inner, None),
                Stmt::assign(tag_of(Expr::local(inner, Type::Struct(s))), lit(5)),
                Stmt::ret(Some(lit(9))),
            ]),
        ],
    );

    p.push_main(Stmt::let_(r, Some(Expr::call(f, vec![], i64_ty()))));
    p.push_main(Stmt::ret(Some(add(
        mul(Expr::global(log, i64_ty()), lit(100)),
        Expr::local(r, i64_ty()),
    ))));
    assert_eq!(run(&p), 5409);
}

#[test]
fn test_delete_runs_destructor_and_deallocator() {
    let mut p = Program::new();
    let (s, log) = tagged_struct(&mut p);
    let freed = p.add_global("freed", i64_ty(), None);
    let ptr = Type::pointer_to(Type::Struct(s));
    let free = p.declare_function("free_s", vec![Param::new("p", ptr)], Type::Void);
    let freed_var = Expr::global(freed, i64_ty());
    p.define_function(
        free,
        vec![Stmt::assign(freed_var.clone(), add(freed_var.clone(), lit(1)))],
    );
    p.structs[s.0 as usize].deallocator = Some(free);

    let obj = p.add_local("obj", Type::Struct(s));
    let obj_var = move || Expr::local(obj, Type::Struct(s));
    p.push_main(Stmt::block(vec![
        Stmt::let_(obj, None),
        Stmt::assign(tag_of(obj_var()), lit(3)),
        Stmt::delete(Expr::address_of(obj_var())),
    ]));
    p.push_main(Stmt::ret(Some(add(
        mul(Expr::global(log, i64_ty()), lit(10)),
        freed_var,
    ))));
    // once by `delete`, once at scope exit
    assert_eq!(run(&p), 332);
}

#[test]
fn test_discarded_temporary_is_destroyed() {
    let mut p = Program::new();
    let (s, log) = tagged_struct(&mut p);
    let proto = p.add_global("proto", Type::Struct(s), None);
    let make = p.declare_function("make", vec![], Type::Struct(s));
    p.define_function(make, vec![Stmt::ret(Some(Expr::global(proto, Type::Struct(s))))]);

    p.push_main(Stmt::assign(tag_of(Expr::global(proto, Type::Struct(s))), lit(6)));
    p.push_main(Stmt::expr(Expr::call(make, vec![], Type::Struct(s))));
    p.push_main(Stmt::ret(Some(Expr::global(log, i64_ty()))));
    assert_eq!(run(&p), 6);
}

#[test]
fn test_address_round_trip() {
    let mut p = Program::new();
    let x = p.add_local("x", i64_ty());
    let ptr = p.add_local("p", Type::pointer_to(i64_ty()));
    let xv = move || Expr::local(x, i64_ty());

    p.push_main(Stmt::let_(x, Some(lit(5))));
    p.push_main(Stmt::let_(ptr, Some(Expr::address_of(xv()))));
    p.push_main(Stmt::assign(
        Expr::deref(Expr::local(ptr, Type::pointer_to(i64_ty()))),
        lit(7),
    ));
    p.push_main(Stmt::ret(Some(xv())));
    assert_eq!(run(&p), 7);
}

fn null_deref_program() -> Program {
    let mut p = Program::new();
    let ptr_ty = Type::pointer_to(i64_ty());
    let ptr = p.add_local("p", ptr_ty.clone());
    p.push_main(Stmt::let_(ptr, Some(Expr::new(ExprKind::Literal(0), ptr_ty.clone()))));
    p.push_main(Stmt::ret(Some(Expr::deref(Expr::local(ptr, ptr_ty)))));
    p
}

#[test]
fn test_null_dereference_traps() {
    let p = null_deref_program();
    for optimize in [true, false] {
        assert!(matches!(
            execute(&p, optimize),
            Err(RuntimeError::Trap { code: 1, .. })
        ));
    }
}

#[test]
fn test_null_checks_can_be_disabled() {
    let compiled = build(
        &null_deref_program(),
        CodegenConfig {
            null_checks: false,
            ..CodegenConfig::default()
        },
    );
    // address zero is the exit slot, still zero at that point
    assert_eq!(Vm::new().run_program(&compiled), Ok(0));
}

#[test]
fn test_recursive_factorial() {
    let mut p = Program::new();
    let fact = p.declare_function("fact", vec![Param::new("n", i64_ty())], i64_ty());
    let n = || Expr::param(0, i64_ty());
    p.define_function(
        fact,
        vec![
            Stmt::if_(cmp(CompareOp::Le, n(), lit(1)), vec![Stmt::ret(Some(lit(1)))], None),
            Stmt::ret(Some(mul(
                n(),
                Expr::call(
                    fact,
                    vec![Expr::binary(BinaryOp::Sub, n(), lit(1))],
                    i64_ty(),
                ),
            ))),
        ],
    );
    p.push_main(Stmt::ret(Some(Expr::call(fact, vec![lit(5)], i64_ty()))));
    assert_eq!(run(&p), 120);
}

#[test]
fn test_by_ref_parameter() {
    let mut p = Program::new();
    let bump = p.declare_function("bump", vec![Param::by_ref("x", i64_ty())], Type::Void);
    let x = || Expr::param(0, i64_ty());
    p.define_function(bump, vec![Stmt::assign(x(), add(x(), lit(1)))]);

    let v = p.add_local("v", i64_ty());
    let vv = move || Expr::local(v, i64_ty());
    p.push_main(Stmt::let_(v, Some(lit(41))));
    p.push_main(Stmt::expr(Expr::call(bump, vec![vv()], Type::Void)));
    p.push_main(Stmt::expr(Expr::call(bump, vec![vv()], Type::Void)));
    p.push_main(Stmt::ret(Some(vv())));
    assert_eq!(run(&p), 43);
}

#[test]
fn test_struct_by_value() {
    let mut p = Program::new();
    let u8_ty = Type::Int(IntType::U8);
    let pair = p.add_struct(StructDef {
        name: "Pair".to_string(),
        fields: vec![
            FieldDef {
                name: "a".to_string(),
                ty: i64_ty(),
                offset: 0,
            },
            FieldDef {
                name: "b".to_string(),
                ty: i64_ty(),
                offset: 8,
            },
            FieldDef {
                name: "c".to_string(),
                ty: u8_ty.clone(),
                offset: 16,
            },
        ],
        size: 17,
        destructor: None,
        deallocator: None,
    });
    let pair_ty = Type::Struct(pair);
    let field = |base: Expr, index: usize| {
        let ty = if index == 2 { Type::Int(IntType::U8) } else { i64_ty() };
        Expr::field(base, index, ty)
    };

    let q = p.add_local("q", pair_ty.clone());
    let swap = p.declare_function("swap", vec![Param::new("p", pair_ty.clone())], pair_ty.clone());
    let arg = || Expr::param(0, Type::Struct(pair));
    let qv = || Expr::local(q, Type::Struct(pair));
    p.define_function(
        swap,
        vec![
            Stmt::let_(q, None),
            Stmt::assign(field(qv(), 0), field(arg(), 1)),
            Stmt::assign(field(qv(), 1), field(arg(), 0)),
            Stmt::assign(
                field(qv(), 2),
                Expr::binary(BinaryOp::Add, field(arg(), 2), Expr::int(1, IntType::U8)),
            ),
            Stmt::ret(Some(qv())),
        ],
    );

    let a = p.add_local("a", pair_ty.clone());
    let r = p.add_local("r", pair_ty.clone());
    let av = || Expr::local(a, Type::Struct(pair));
    let rv = || Expr::local(r, Type::Struct(pair));
    p.push_main(Stmt::let_(a, None));
    p.push_main(Stmt::assign(field(av(), 0), lit(1)));
    p.push_main(Stmt::assign(field(av(), 1), lit(2)));
    p.push_main(Stmt::assign(field(av(), 2), Expr::int(7, IntType::U8)));
    p.push_main(Stmt::let_(r, Some(Expr::call(swap, vec![av()], pair_ty))));
    p.push_main(Stmt::ret(Some(add(
        add(mul(field(rv(), 0), lit(100)), mul(field(rv(), 1), lit(10))),
        Expr::cast(field(rv(), 2), IntType::I64),
    ))));
    assert_eq!(run(&p), 218);
}

#[test]
fn test_indirect_call() {
    let mut p = Program::new();
    let double = p.declare_function("double", vec![Param::new("x", i64_ty())], i64_ty());
    p.define_function(
        double,
        vec![Stmt::ret(Some(mul(Expr::param(0, i64_ty()), lit(2))))],
    );

    let fn_ty = Type::function(vec![Param::new("x", i64_ty())], i64_ty());
    let f = p.add_local("f", fn_ty.clone());
    p.push_main(Stmt::let_(f, Some(Expr::function_ref(double, fn_ty.clone()))));
    p.push_main(Stmt::ret(Some(Expr::call_indirect(
        Expr::local(f, fn_ty),
        vec![lit(21)],
    ))));
    assert_eq!(run(&p), 42);
}

#[test]
fn test_array_and_pointer_indexing() {
    let mut p = Program::new();
    let arr_ty = Type::array_of(i64_ty(), 4);
    let ptr_ty = Type::pointer_to(i64_ty());
    let arr = p.add_local("arr", arr_ty);
    let i = p.add_local("i", i64_ty());
    let ptr = p.add_local("p", ptr_ty.clone());
    let av = || Expr::local(arr, Type::array_of(i64_ty(), 4));
    let iv = move || Expr::local(i, i64_ty());

    p.push_main(Stmt::let_(arr, None));
    p.push_main(Stmt::for_(
        Some(Stmt::let_(i, Some(lit(0)))),
        Some(cmp(CompareOp::Lt, iv(), lit(4))),
        Some(Stmt::assign(iv(), add(iv(), lit(1)))),
        vec![Stmt::assign(Expr::index(av(), iv()), mul(iv(), iv()))],
    ));
    p.push_main(Stmt::let_(ptr, Some(Expr::address_of(Expr::index(av(), lit(1))))));
    p.push_main(Stmt::ret(Some(add(
        mul(Expr::index(av(), lit(3)), lit(10)),
        Expr::index(Expr::local(ptr, ptr_ty), lit(1)),
    ))));
    assert_eq!(run(&p), 94);
}

#[test]
fn test_logical_operators_short_circuit() {
    let mut p = Program::new();
    let calls = p.add_global("calls", i64_ty(), None);
    let calls_var = move || Expr::global(calls, i64_ty());
    let touch = p.declare_function("touch", vec![], Type::Bool);
    p.define_function(
        touch,
        vec![
            Stmt::assign(calls_var(), add(calls_var(), lit(1))),
            Stmt::ret(Some(Expr::bool(true))),
        ],
    );
    let call_touch = move || Expr::call(touch, vec![], Type::Bool);

    let b = p.add_local("b", Type::Bool);
    let c = p.add_local("c", Type::Bool);
    let d = p.add_local("d", Type::Bool);
    let e = p.add_local("e", Type::Bool);
    let as_int = |id| Expr::cast(Expr::local(id, Type::Bool), IntType::I64);

    p.push_main(Stmt::let_(
        b,
        Some(Expr::and(
            cmp(CompareOp::Lt, lit(1), lit(2)),
            Expr::not(cmp(CompareOp::Lt, lit(3), lit(2))),
        )),
    ));
    p.push_main(Stmt::let_(
        c,
        Some(Expr::and(cmp(CompareOp::Lt, lit(2), lit(1)), call_touch())),
    ));
    p.push_main(Stmt::let_(
        d,
        Some(Expr::or(cmp(CompareOp::Lt, lit(1), lit(2)), call_touch())),
    ));
    p.push_main(Stmt::let_(e, Some(Expr::or(call_touch(), Expr::bool(false)))));
    p.push_main(Stmt::ret(Some(add(
        add(
            add(mul(as_int(b), lit(10000)), mul(as_int(c), lit(1000))),
            add(mul(as_int(d), lit(100)), mul(as_int(e), lit(10))),
        ),
        calls_var(),
    ))));
    assert_eq!(run(&p), 10111);
}

#[test]
fn test_unsigned_and_signed_compare() {
    let mut p = Program::new();
    let unsigned = cmp(
        CompareOp::Gt,
        Expr::int(200, IntType::U8),
        Expr::int(100, IntType::U8),
    );
    let signed = cmp(
        CompareOp::Lt,
        Expr::int(-56, IntType::I8),
        Expr::int(100, IntType::I8),
    );
    p.push_main(Stmt::ret(Some(add(
        mul(Expr::cast(unsigned, IntType::I64), lit(10)),
        Expr::cast(signed, IntType::I64),
    ))));
    assert_eq!(run(&p), 11);
}

fn exit_of(value: Expr) -> i64 {
    let mut p = Program::new();
    p.push_main(Stmt::ret(Some(value)));
    run(&p)
}

fn u8_lit(value: i64) -> Expr {
    Expr::int(value, IntType::U8)
}

fn u64_lit(value: i64) -> Expr {
    Expr::int(value, IntType::U64)
}

#[test]
fn test_unsigned_division_and_shift() {
    let div = Expr::binary(BinaryOp::Div, u8_lit(200), u8_lit(2));
    assert_eq!(exit_of(Expr::cast(div, IntType::I64)), 100);
    let shr = Expr::binary(BinaryOp::Shr, u8_lit(200), u8_lit(1));
    assert_eq!(exit_of(Expr::cast(shr, IntType::I64)), 100);
    let rem = Expr::binary(BinaryOp::Rem, u8_lit(250), u8_lit(7));
    assert_eq!(exit_of(Expr::cast(rem, IntType::I64)), 5);

    let wide_div = Expr::binary(BinaryOp::Div, u64_lit(-1), u64_lit(1 << 62));
    assert_eq!(exit_of(Expr::cast(wide_div, IntType::I64)), 3);
    let wide_shr = Expr::binary(BinaryOp::Shr, u64_lit(-16), u64_lit(60));
    assert_eq!(exit_of(Expr::cast(wide_shr, IntType::I64)), 15);
    let wide_rem = Expr::binary(BinaryOp::Rem, u64_lit(-1), u64_lit(10));
    assert_eq!(exit_of(Expr::cast(wide_rem, IntType::I64)), 5);
}

#[test]
fn test_signed_shift_stays_arithmetic() {
    let shr = Expr::binary(BinaryOp::Shr, Expr::int(-128, IntType::I8), Expr::int(1, IntType::I8));
    assert_eq!(exit_of(Expr::cast(shr, IntType::I64)), -64);
}

#[test]
fn test_wide_unsigned_compare() {
    let mut p = Program::new();
    p.push_main(Stmt::if_(
        cmp(CompareOp::Gt, u64_lit(-1), u64_lit(1)),
        vec![Stmt::ret(Some(lit(1)))],
        None,
    ));
    p.push_main(Stmt::ret(Some(lit(0))));
    assert_eq!(run(&p), 1);

    let as_value = |op, lhs, rhs| Expr::cast(cmp(op, lhs, rhs), IntType::I64);
    let u32_max = Expr::int(-1, IntType::U32);
    assert_eq!(
        exit_of(add(
            add(
                mul(as_value(CompareOp::Lt, u64_lit(1), u64_lit(-1)), lit(100)),
                mul(as_value(CompareOp::Ge, u64_lit(-1), u64_lit(-2)), lit(10)),
            ),
            as_value(CompareOp::Gt, u32_max, Expr::int(1, IntType::U32)),
        )),
        111
    );
}

#[test]
fn test_runtime_index_into_returned_array() {
    let mut p = Program::new();
    let i32_ty = Type::Int(IntType::I32);
    let arr_ty = Type::array_of(i32_ty.clone(), 3);
    let make = p.declare_function("make", vec![], arr_ty.clone());
    let a = p.add_local("a", arr_ty.clone());
    let av = || Expr::local(a, Type::array_of(Type::Int(IntType::I32), 3));
    let mut body = vec![Stmt::let_(a, None)];
    for (k, v) in [5, 6, 7].into_iter().enumerate() {
        body.push(Stmt::assign(
            Expr::index(av(), lit(k as i64)),
            Expr::int(v, IntType::I32),
        ));
    }
    body.push(Stmt::ret(Some(av())));
    p.define_function(make, body);

    let i = p.add_local("i", i64_ty());
    let iv = move || Expr::local(i, i64_ty());
    let element = |index: Expr| {
        Expr::cast(
            Expr::index(Expr::call(make, vec![], arr_ty.clone()), index),
            IntType::I64,
        )
    };
    p.push_main(Stmt::let_(i, Some(lit(2))));
    p.push_main(Stmt::ret(Some(add(
        add(mul(element(iv()), lit(100)), mul(element(add(iv(), lit(-1))), lit(10))),
        element(add(iv(), lit(-2))),
    ))));
    assert_eq!(run(&p), 765);
}

#[test]
fn test_narrow_arithmetic_wraps() {
    let mut p = Program::new();
    let signed = Expr::binary(
        BinaryOp::Add,
        Expr::int(100, IntType::I8),
        Expr::int(100, IntType::I8),
    );
    let unsigned = Expr::binary(
        BinaryOp::Add,
        Expr::int(200, IntType::U8),
        Expr::int(100, IntType::U8),
    );
    p.push_main(Stmt::ret(Some(add(
        mul(Expr::cast(signed, IntType::I64), lit(1000)),
        Expr::cast(unsigned, IntType::I64),
    ))));
    assert_eq!(run(&p), -56 * 1000 + 44);
}

#[test]
fn test_bitwise_and_shift_operators() {
    let mut p = Program::new();
    let bits = Expr::binary(
        BinaryOp::BitXor,
        Expr::binary(
            BinaryOp::BitOr,
            Expr::binary(BinaryOp::BitAnd, lit(12), lit(10)),
            lit(1),
        ),
        lit(3),
    );
    let shifts = Expr::binary(
        BinaryOp::Shr,
        Expr::binary(BinaryOp::Shl, lit(1), lit(6)),
        lit(3),
    );
    let rem = Expr::binary(
        BinaryOp::Rem,
        Expr::unary(UnaryOp::Neg, lit(-5)),
        lit(3),
    );
    let div = Expr::binary(BinaryOp::Div, lit(17), lit(5));
    let complement = Expr::unary(UnaryOp::BitNot, lit(0));
    p.push_main(Stmt::ret(Some(add(
        add(add(bits, shifts), add(rem, div)),
        complement,
    ))));
    assert_eq!(run(&p), 10 + 8 + 2 + 3 - 1);
}

#[test]
fn test_global_initializers() {
    let mut p = Program::new();
    let g = p.add_global("g", i64_ty(), Some(lit(40)));
    let h = p.add_global("h", Type::Int(IntType::I32), Some(Expr::int(2, IntType::I32)));
    p.push_main(Stmt::ret(Some(add(
        Expr::global(g, i64_ty()),
        Expr::cast(Expr::global(h, Type::Int(IntType::I32)), IntType::I64),
    ))));
    assert_eq!(run(&p), 42);
}

#[test]
fn test_division_by_zero() {
    let mut p = Program::new();
    p.push_main(Stmt::ret(Some(Expr::binary(BinaryOp::Div, lit(1), lit(0)))));
    assert!(matches!(
        execute(&p, true),
        Err(RuntimeError::DivisionByZero { .. })
    ));
}

#[test]
fn test_infinite_loop_hits_step_limit() {
    let mut p = Program::new();
    p.push_main(Stmt::while_(Expr::bool(true), vec![]));
    let compiled = build(&p, CodegenConfig::default());
    let mut vm = Vm::with_config(VmConfig {
        max_steps: Some(1_000),
        ..VmConfig::default()
    });
    assert_eq!(
        vm.run_program(&compiled),
        Err(RuntimeError::StepLimit { limit: 1_000 })
    );
}

#[test]
fn test_program_survives_serialization() {
    let mut p = Program::new();
    let identity = p.declare_function("identity", vec![Param::new("n", i64_ty())], i64_ty());
    p.define_function(identity, vec![Stmt::ret(Some(Expr::param(0, i64_ty())))]);
    p.push_main(Stmt::ret(Some(Expr::call(identity, vec![lit(11)], i64_ty()))));

    let decoded = Program::from_bytes(&p.to_bytes().unwrap()).unwrap();
    let compiled = build(&decoded, CodegenConfig::default());
    let reloaded = CompiledProgram::from_bytes(&compiled.to_bytes().unwrap()).unwrap();
    assert_eq!(Vm::new().run_program(&reloaded), Ok(11));
}
