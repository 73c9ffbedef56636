//! End-to-end execution tests: each test assembles a module tree, runs a
//! function through the interpreter, and checks the returned value.

mod common;

use common::*;
use crabwalk::memory::Allocation;
use crabwalk::mir::{
    Body, CallTarget, Constant, DropKind, LValue, Param, Path, RValue, Statement, Terminator,
};
use crabwalk::module::{ExternLink, FunctionDef, ModuleTree};
use crabwalk::ty::{
    BorrowKind, Composite, CompositeBody, Mutability, RawType, TypeRef, TypeWrapper, Variant,
};

#[test]
fn arithmetic_mul() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::U32.into(), RawType::U32.into()],
        vec![ret_block(vec![
            use_uint(LValue::Local(0), 3, RawType::U32),
            use_uint(LValue::Local(1), 4, RawType::U32),
            assign(
                LValue::Return,
                RValue::BinOp {
                    op: crabwalk::mir::BinOp::Mul,
                    lhs: Param::LValue(LValue::Local(0)),
                    rhs: Param::LValue(LValue::Local(1)),
                },
            ),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 12);
}

#[test]
fn pointer_round_trip() {
    let ptr_ty = TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Unique));
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::U32.into(), ptr_ty],
        vec![ret_block(vec![
            use_uint(LValue::Local(0), 0x1122_3344, RawType::U32),
            assign(LValue::Local(1), RValue::Borrow { kind: BorrowKind::Unique, val: LValue::Local(0) }),
            use_uint(LValue::Local(1).deref(), 0xDEAD_BEEF, RawType::U32),
            assign(LValue::Return, RValue::Use(LValue::Local(0))),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 0xDEAD_BEEF);
}

fn tag_only_composite(path: &str, tags: Vec<Vec<u8>>) -> std::rc::Rc<Composite> {
    Composite::define_new(
        Path::from(path),
        CompositeBody {
            size: 1,
            fields: vec![(0, RawType::U8.into())],
            variants: tags
                .into_iter()
                .map(|tag_data| Variant {
                    data_field: None,
                    base_field: Some(0),
                    field_path: vec![],
                    tag_data,
                })
                .collect(),
            drop_glue: None,
        },
    )
}

#[test]
fn variant_tag_selects_switch_target() {
    let two = tag_only_composite("t::Two", vec![vec![0x00], vec![0x01]]);
    let mut tree = ModuleTree::default();
    tree.register_composite(two.clone());
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Composite(two).into()],
        vec![
            block(
                vec![assign(
                    LValue::Local(0),
                    RValue::Variant { path: Path::from("t::Two"), index: 1, val: None },
                )],
                Terminator::Switch { val: LValue::Local(0), targets: vec![1, 2] },
            ),
            ret_block(vec![use_uint(LValue::Return, 10, RawType::U32)]),
            ret_block(vec![use_uint(LValue::Return, 20, RawType::U32)]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 20);
}

#[test]
fn switch_falls_back_to_default_variant() {
    // One tagged variant plus an untagged default; the stored tag byte
    // matches neither.
    let mixed = Composite::define_new(
        Path::from("t::Mixed"),
        CompositeBody {
            size: 1,
            fields: vec![(0, RawType::U8.into())],
            variants: vec![
                Variant {
                    data_field: None,
                    base_field: Some(0),
                    field_path: vec![],
                    tag_data: vec![0x01],
                },
                Variant { data_field: None, base_field: None, field_path: vec![], tag_data: vec![] },
            ],
            drop_glue: None,
        },
    );
    let mut tree = ModuleTree::default();
    tree.register_composite(mixed.clone());
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Composite(mixed).into()],
        vec![
            block(
                vec![use_uint(LValue::Local(0).field(0), 0x02, RawType::U8)],
                Terminator::Switch { val: LValue::Local(0), targets: vec![1, 2] },
            ),
            ret_block(vec![use_uint(LValue::Return, 1, RawType::U32)]),
            ret_block(vec![use_uint(LValue::Return, 99, RawType::U32)]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 99);
}

#[test]
fn switch_without_match_or_default_is_fatal() {
    let lone = tag_only_composite("t::Lone", vec![vec![0x01]]);
    let mut tree = ModuleTree::default();
    tree.register_composite(lone.clone());
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Composite(lone).into()],
        vec![
            block(
                vec![use_uint(LValue::Local(0).field(0), 0x02, RawType::U8)],
                Terminator::Switch { val: LValue::Local(0), targets: vec![1] },
            ),
            ret_block(vec![]),
        ],
    ));
    let err = run_fn(&tree, "t::main").unwrap_err();
    let pattern = regex::Regex::new(r"matched no variant and has no default").unwrap();
    assert!(pattern.is_match(&err.to_string()), "unexpected error: {err:#}");
}

#[test]
fn static_string_builds_a_fat_pointer() {
    let str_ref = TypeRef::from(RawType::Str).wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::meta",
        RawType::USize.into(),
        vec![str_ref.clone()],
        vec![ret_block(vec![
            assign(LValue::Local(0), RValue::Constant(Constant::StaticString("hello".into()))),
            assign(LValue::Return, RValue::DstMeta { val: LValue::Local(0) }),
        ])],
    ));
    tree.register_function(zero_arg(
        "t::ptr",
        RawType::USize.into(),
        vec![str_ref],
        vec![ret_block(vec![
            assign(LValue::Local(0), RValue::Constant(Constant::StaticString("hello".into()))),
            assign(LValue::Return, RValue::DstPtr { val: LValue::Local(0) }),
        ])],
    ));

    let meta = run_fn(&tree, "t::meta").unwrap();
    assert_eq!(meta.read_usize(0).unwrap(), 5);

    let ptr = run_fn(&tree, "t::ptr").unwrap();
    assert_eq!(ptr.read_usize(0).unwrap(), 0);
    let handle = ptr.relocation_at(0).expect("string pointer carries provenance");
    let cell = handle.as_memory().expect("string pointer targets memory").clone();
    let alloc = cell.borrow();
    assert_eq!(alloc.bytes(0, alloc.len()).unwrap(), b"hello");
}

#[test]
fn cast_sign_extends_i32_to_u64() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U64.into(),
        vec![RawType::I32.into()],
        vec![ret_block(vec![
            assign(
                LValue::Local(0),
                RValue::Constant(Constant::Int { value: -1, ty: RawType::I32 }),
            ),
            assign(LValue::Return, RValue::Cast { val: LValue::Local(0), ty: RawType::U64.into() }),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 8).unwrap(), 0xFFFF_FFFF_FFFF_FFFF);
}

#[test]
fn call_passes_arguments_and_returns() {
    let mut tree = ModuleTree::default();
    tree.register_function(function(
        "t::add",
        vec![RawType::U32.into(), RawType::U32.into()],
        RawType::U32.into(),
        vec![],
        vec![ret_block(vec![assign(
            LValue::Return,
            RValue::BinOp {
                op: crabwalk::mir::BinOp::Add,
                lhs: Param::LValue(LValue::Argument(0)),
                rhs: Param::LValue(LValue::Argument(1)),
            },
        )])],
    ));
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![],
        vec![
            block(
                vec![],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Path(Path::from("t::add")),
                    args: vec![uint_const(3, RawType::U32), uint_const(39, RawType::U32)],
                    ret_block: 1,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 42);
}

#[test]
fn call_through_function_pointer() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::forty",
        RawType::U32.into(),
        vec![],
        vec![ret_block(vec![use_uint(LValue::Return, 40, RawType::U32)])],
    ));
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Function.into()],
        vec![
            block(
                vec![assign(
                    LValue::Local(0),
                    RValue::Constant(Constant::ItemAddr(Path::from("t::forty"))),
                )],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Value(LValue::Local(0)),
                    args: vec![],
                    ret_block: 1,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 40);
}

#[test]
fn slice_index_through_fat_pointer() {
    let arr_ty = TypeRef::from(RawType::U16).wrapped(TypeWrapper::Array(3));
    let arr_ref = arr_ty.clone().wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
    let thin = TypeRef::from(RawType::U16).wrapped(TypeWrapper::Pointer(Mutability::Const));
    let slice_ref = TypeRef::from(RawType::U16)
        .wrapped(TypeWrapper::Slice)
        .wrapped(TypeWrapper::Borrow(BorrowKind::Shared));

    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U16.into(),
        vec![arr_ty, arr_ref, thin.clone(), slice_ref, RawType::USize.into()],
        vec![ret_block(vec![
            assign(
                LValue::Local(0),
                RValue::Array {
                    vals: vec![
                        uint_const(10, RawType::U16),
                        uint_const(20, RawType::U16),
                        uint_const(30, RawType::U16),
                    ],
                },
            ),
            assign(LValue::Local(1), RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(0) }),
            assign(LValue::Local(2), RValue::Cast { val: LValue::Local(1), ty: thin }),
            assign(
                LValue::Local(3),
                RValue::MakeDst {
                    ptr: Param::LValue(LValue::Local(2)),
                    meta: uint_const(3, RawType::USize),
                },
            ),
            use_uint(LValue::Local(4), 1, RawType::USize),
            assign(
                LValue::Return,
                RValue::Use(LValue::Local(3).deref().index(LValue::Local(4))),
            ),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 2).unwrap(), 20);
}

#[test]
fn transmute_reinterprets_float_bits() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::F32.into()],
        vec![
            block(
                vec![assign(
                    LValue::Local(0),
                    RValue::Constant(Constant::Float { value: 1.0, ty: RawType::F32 }),
                )],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Intrinsic {
                        name: "transmute".into(),
                        params: vec![RawType::F32.into(), RawType::U32.into()],
                    },
                    args: vec![Param::LValue(LValue::Local(0))],
                    ret_block: 1,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 0x3F80_0000);
}

#[test]
fn atomic_intrinsics_access_the_pointee() {
    let ptr_ty = TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Unique));
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::U32.into(), ptr_ty, TypeRef::unit()],
        vec![
            block(
                vec![assign(
                    LValue::Local(1),
                    RValue::Borrow { kind: BorrowKind::Unique, val: LValue::Local(0) },
                )],
                Terminator::Call {
                    dst: LValue::Local(2),
                    target: CallTarget::Intrinsic {
                        name: "atomic_store".into(),
                        params: vec![RawType::U32.into()],
                    },
                    args: vec![Param::LValue(LValue::Local(1)), uint_const(7, RawType::U32)],
                    ret_block: 1,
                },
            ),
            block(
                vec![],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Intrinsic {
                        name: "atomic_load".into(),
                        params: vec![RawType::U32.into()],
                    },
                    args: vec![Param::LValue(LValue::Local(1))],
                    ret_block: 2,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 7);
}

fn droppy_module(drop_flags: Vec<bool>, flag: Option<usize>) -> ModuleTree {
    let droppy = Composite::define_new(
        Path::from("t::Droppy"),
        CompositeBody {
            size: 4,
            fields: vec![(0, RawType::U32.into())],
            variants: vec![],
            drop_glue: Some(Path::from("t::droppy_drop")),
        },
    );
    let mut tree = ModuleTree::default();
    tree.register_composite(droppy.clone());
    tree.register_static(Path::from("t::DROPPED"), RawType::U8.into(), Allocation::zeroed(1));
    tree.register_function(function(
        "t::droppy_drop",
        vec![TypeRef::from(RawType::Composite(droppy.clone())).wrapped(TypeWrapper::Borrow(BorrowKind::Move))],
        TypeRef::unit(),
        vec![],
        vec![ret_block(vec![use_uint(
            LValue::Static(Path::from("t::DROPPED")),
            1,
            RawType::U8,
        )])],
    ));
    tree.register_function(FunctionDef {
        path: Path::from("t::main"),
        args: vec![],
        ret_ty: RawType::U8.into(),
        external: None,
        body: Body {
            blocks: vec![ret_block(vec![
                Statement::Drop { slot: LValue::Local(0), flag, kind: DropKind::Deep },
                assign(LValue::Return, RValue::Use(LValue::Static(Path::from("t::DROPPED")))),
            ])],
            locals: vec![RawType::Composite(droppy).into()],
            drop_flags,
        },
    });
    tree
}

#[test]
fn drop_glue_runs_without_a_flag() {
    let tree = droppy_module(vec![], None);
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 1).unwrap(), 1);
}

#[test]
fn unset_drop_flag_skips_the_glue() {
    let tree = droppy_module(vec![false], Some(0));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 1).unwrap(), 0);
}

#[test]
fn extern_functions_bypass_mir_dispatch() {
    let mut tree = ModuleTree::default();
    tree.register_function(FunctionDef {
        path: Path::from("t::register_handler"),
        args: vec![],
        ret_ty: RawType::USize.into(),
        external: Some(ExternLink {
            name: "AddVectoredExceptionHandler".into(),
            abi: "system".into(),
        }),
        body: Body { blocks: vec![], locals: vec![], drop_flags: vec![] },
    });
    tree.register_function(zero_arg(
        "t::main",
        RawType::USize.into(),
        vec![],
        vec![
            block(
                vec![],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Path(Path::from("t::register_handler")),
                    args: vec![],
                    ret_block: 1,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_usize(0).unwrap(), 1);
}

#[test]
fn if_branches_on_condition() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Bool.into()],
        vec![
            block(
                vec![assign(LValue::Local(0), RValue::Constant(Constant::Bool(true)))],
                Terminator::If { cond: LValue::Local(0), bb_true: 1, bb_false: 2 },
            ),
            ret_block(vec![use_uint(LValue::Return, 1, RawType::U32)]),
            ret_block(vec![use_uint(LValue::Return, 2, RawType::U32)]),
        ],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 1);
}

#[test]
fn if_rejects_invalid_condition_byte() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Bool.into()],
        vec![
            block(
                vec![use_uint(LValue::Local(0), 2, RawType::U8)],
                Terminator::If { cond: LValue::Local(0), bb_true: 1, bb_false: 1 },
            ),
            ret_block(vec![]),
        ],
    ));
    let err = run_fn(&tree, "t::main").unwrap_err();
    assert!(err.to_string().contains("neither 0 nor 1"), "unexpected error: {err:#}");
}

#[test]
fn unknown_intrinsic_is_fatal() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        TypeRef::unit(),
        vec![],
        vec![
            block(
                vec![],
                Terminator::Call {
                    dst: LValue::Return,
                    target: CallTarget::Intrinsic { name: "spooky".into(), params: vec![] },
                    args: vec![],
                    ret_block: 1,
                },
            ),
            ret_block(vec![]),
        ],
    ));
    let err = run_fn(&tree, "t::main").unwrap_err();
    let pattern = regex::Regex::new(r"unknown intrinsic `spooky`").unwrap();
    assert!(pattern.is_match(&err.to_string()), "unexpected error: {err:#}");
}

#[test]
fn struct_rvalue_lays_out_fields() {
    let pair = Composite::define_new(
        Path::from("t::Pair"),
        CompositeBody {
            size: 8,
            fields: vec![(0, RawType::U32.into()), (4, RawType::U32.into())],
            variants: vec![],
            drop_glue: None,
        },
    );
    let mut tree = ModuleTree::default();
    tree.register_composite(pair.clone());
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::Composite(pair).into()],
        vec![ret_block(vec![
            assign(
                LValue::Local(0),
                RValue::Struct {
                    path: Path::from("t::Pair"),
                    vals: vec![uint_const(7, RawType::U32), uint_const(9, RawType::U32)],
                },
            ),
            assign(LValue::Return, RValue::Use(LValue::Local(0).field(1))),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 9);
}

#[test]
fn sized_array_repeats_and_indexes() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![
            TypeRef::from(RawType::U32).wrapped(TypeWrapper::Array(4)),
            RawType::USize.into(),
        ],
        vec![ret_block(vec![
            assign(
                LValue::Local(0),
                RValue::SizedArray { val: uint_const(5, RawType::U32), count: 4 },
            ),
            use_uint(LValue::Local(1), 3, RawType::USize),
            assign(LValue::Return, RValue::Use(LValue::Local(0).index(LValue::Local(1)))),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 5);
}

#[test]
fn serialized_module_executes_after_reload() {
    let mut tree = ModuleTree::default();
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![RawType::U32.into(), RawType::U32.into()],
        vec![ret_block(vec![
            use_uint(LValue::Local(0), 6, RawType::U32),
            use_uint(LValue::Local(1), 7, RawType::U32),
            assign(
                LValue::Return,
                RValue::BinOp {
                    op: crabwalk::mir::BinOp::Mul,
                    lhs: Param::LValue(LValue::Local(0)),
                    rhs: Param::LValue(LValue::Local(1)),
                },
            ),
        ])],
    ));
    tree.set_lang_item("start", Path::from("t::main"));

    let bytes = crabwalk::module::format::to_bytes(&tree).unwrap();
    let reloaded = ModuleTree::from_bytes(&bytes).unwrap();
    let ret = run_fn(&reloaded, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 42);
}

#[test]
fn entry_protocol_passes_argc_and_argv() {
    let argv_ty = TypeRef::from(RawType::I8)
        .wrapped(TypeWrapper::Pointer(Mutability::Const))
        .wrapped(TypeWrapper::Pointer(Mutability::Const));
    let mut tree = ModuleTree::default();
    tree.register_function(function(
        "app::start",
        vec![RawType::I32.into(), argv_ty],
        RawType::ISize.into(),
        vec![],
        vec![ret_block(vec![assign(
            LValue::Return,
            RValue::Cast { val: LValue::Argument(0), ty: RawType::ISize.into() },
        )])],
    ));
    tree.set_lang_item("start", Path::from("app::start"));
    tree.verify().unwrap();

    let ret = crabwalk::run_entry(&tree).unwrap();
    assert_eq!(ret.read_sint(0, 8).unwrap(), 0);
}

#[test]
fn projection_round_trip_preserves_bytes_and_relocations() {
    // Write a pointer-carrying value through a nested place, read it back,
    // and require byte and relocation equality.
    let inner_ptr = TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Shared));
    let holder = Composite::define_new(
        Path::from("t::Holder"),
        CompositeBody {
            size: 16,
            fields: vec![(0, RawType::U64.into()), (8, inner_ptr)],
            variants: vec![],
            drop_glue: None,
        },
    );
    let mut tree = ModuleTree::default();
    tree.register_composite(holder.clone());
    tree.register_function(zero_arg(
        "t::main",
        RawType::U32.into(),
        vec![
            RawType::Composite(holder).into(),
            RawType::U32.into(),
            TypeRef::from(RawType::U32).wrapped(TypeWrapper::Borrow(BorrowKind::Shared)),
        ],
        vec![ret_block(vec![
            use_uint(LValue::Local(1), 0xAB, RawType::U32),
            assign(LValue::Local(2), RValue::Borrow { kind: BorrowKind::Shared, val: LValue::Local(1) }),
            // Store the pointer into the composite field, then read it back
            // out through the same projection and deref it.
            assign(LValue::Local(0).field(1), RValue::Use(LValue::Local(2))),
            assign(LValue::Return, RValue::Use(LValue::Local(0).field(1).deref())),
        ])],
    ));
    let ret = run_fn(&tree, "t::main").unwrap();
    assert_eq!(ret.read_uint(0, 4).unwrap(), 0xAB);
}
