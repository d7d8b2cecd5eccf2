//! End-to-end compilation tests
//!
//! Each test builds the AST the parser would deliver, compiles it to a
//! real image in a temp directory, and asserts on the produced container:
//! header fields, determinism, diagnostics. The test environment cannot
//! execute foreign-ISA binaries, so runtime behavior is pinned by the
//! structural and encoding tests instead.

use flap_ast::{BinaryOp, Expr, Lambda, MatchArm, PipeKind, Program, Span};
use flapc::{compile, CompileError, CompileOptions};
use std::path::PathBuf;

fn sp() -> Span {
    Span::new(1, 1)
}

fn num(v: f64) -> Expr {
    Expr::Number { value: v, span: sp() }
}

fn ident(name: &str) -> Expr {
    Expr::Ident { name: name.to_string(), span: sp() }
}

fn string(v: &str) -> Expr {
    Expr::Str { value: v.to_string(), span: sp() }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call { name: name.to_string(), args, span: sp() }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span: sp() }
}

fn program(stmts: Vec<Expr>) -> Program {
    Program { file: "test.flap".to_string(), stmts, imports: vec![] }
}

fn out_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn compile_to_bytes(p: &Program, triple: &str) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = out_path(&dir, "a.out");
    compile(p, &path, triple, &CompileOptions::default()).unwrap();
    std::fs::read(&path).unwrap()
}

fn hello() -> Program {
    program(vec![call("println", vec![string("Hello, World!")])])
}

#[test]
fn test_hello_world_elf_x86_64() {
    let bytes = compile_to_bytes(&hello(), "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
    assert_eq!(bytes[4], 2);
    assert_eq!(u16::from_le_bytes(bytes[18..20].try_into().unwrap()), 62);
    let s = String::from_utf8_lossy(&bytes);
    assert!(s.contains("/lib64/ld-linux-x86-64.so.2"));
    assert!(s.contains("libc.so.6"));
    assert!(s.contains("Hello, World!"));
}

#[test]
fn test_hello_world_elf_aarch64_and_riscv() {
    let bytes = compile_to_bytes(&hello(), "aarch64-unknown-linux-gnu");
    assert_eq!(u16::from_le_bytes(bytes[18..20].try_into().unwrap()), 183);

    let bytes = compile_to_bytes(&hello(), "riscv64gc-unknown-linux-gnu");
    assert_eq!(u16::from_le_bytes(bytes[18..20].try_into().unwrap()), 243);
    // EF_RISCV_FLOAT_ABI_DOUBLE
    assert_eq!(u32::from_le_bytes(bytes[48..52].try_into().unwrap()), 0x4);
}

#[test]
fn test_compilation_is_deterministic() {
    // compile(P) == compile(P), byte for byte, on every target.
    for triple in [
        "x86_64-unknown-linux-gnu",
        "aarch64-unknown-linux-gnu",
        "riscv64gc-unknown-linux-gnu",
    ] {
        let a = compile_to_bytes(&hello(), triple);
        let b = compile_to_bytes(&hello(), triple);
        assert_eq!(a, b, "non-deterministic output for {triple}");
    }
}

#[test]
fn test_fibonacci_tail_recursive() {
    let fib_body = Expr::Match {
        arms: vec![MatchArm {
            guard: binary(BinaryOp::Eq, ident("n"), num(0.0)),
            body: ident("a"),
        }],
        default: Some(Box::new(call(
            "fib",
            vec![
                binary(BinaryOp::Sub, ident("n"), num(1.0)),
                ident("b"),
                binary(BinaryOp::Add, ident("a"), ident("b")),
            ],
        ))),
        span: sp(),
    };
    let p = program(vec![
        Expr::Define {
            name: "fib".to_string(),
            value: Box::new(Expr::LambdaExpr {
                lambda: Box::new(Lambda {
                    name: "fib".to_string(),
                    params: vec!["n".to_string(), "a".to_string(), "b".to_string()],
                    captures: vec![],
                    body: fib_body,
                    span: sp(),
                }),
                span: sp(),
            }),
            span: sp(),
        },
        call("printf", vec![string("%v\n"), call("fib", vec![num(10.0), num(0.0), num(1.0)])]),
    ]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
}

#[test]
fn test_map_literal_lookup() {
    // m := {0:100, 1:30}; printf("%v,%v\n", m[0], m[1])
    let p = program(vec![
        Expr::DefineMut {
            name: "m".to_string(),
            value: Box::new(Expr::MapLit {
                entries: vec![(num(0.0), num(100.0)), (num(1.0), num(30.0))],
                span: sp(),
            }),
            span: sp(),
        },
        call(
            "printf",
            vec![
                string("%v,%v\n"),
                Expr::Index { target: Box::new(ident("m")), key: Box::new(num(0.0)), span: sp() },
                Expr::Index { target: Box::new(ident("m")), key: Box::new(num(1.0)), span: sp() },
            ],
        ),
    ]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
}

#[test]
fn test_list_sum_reduce_pipe() {
    // xs := [1,2,3,4,5]; printf("%v\n", xs ||| (a,x)=>a+x)
    let p = program(vec![
        Expr::DefineMut {
            name: "xs".to_string(),
            value: Box::new(Expr::List {
                elems: vec![num(1.0), num(2.0), num(3.0), num(4.0), num(5.0)],
                span: sp(),
            }),
            span: sp(),
        },
        call(
            "printf",
            vec![
                string("%v\n"),
                Expr::Pipe {
                    kind: PipeKind::Reduce,
                    value: Box::new(ident("xs")),
                    func: Box::new(Expr::LambdaExpr {
                        lambda: Box::new(Lambda {
                            name: "lambda_0".to_string(),
                            params: vec!["a".to_string(), "x".to_string()],
                            captures: vec![],
                            body: binary(BinaryOp::Add, ident("a"), ident("x")),
                            span: sp(),
                        }),
                        span: sp(),
                    }),
                    span: sp(),
                },
            ],
        ),
    ]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
}

#[test]
fn test_or_default_on_division_by_zero() {
    // r := 10/0; printf("%v\n", r or! 42)
    let p = program(vec![
        Expr::DefineMut {
            name: "r".to_string(),
            value: Box::new(binary(BinaryOp::Div, num(10.0), num(0.0))),
            span: sp(),
        },
        call(
            "printf",
            vec![
                string("%v\n"),
                Expr::OrDefault {
                    value: Box::new(ident("r")),
                    default: Box::new(num(42.0)),
                    span: sp(),
                },
            ],
        ),
    ]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
}

#[test]
fn test_parallel_sum_links_pthread() {
    let p = program(vec![
        Expr::DefineMut { name: "total".to_string(), value: Box::new(num(0.0)), span: sp() },
        Expr::RangeLoop {
            var: "i".to_string(),
            start: Box::new(num(0.0)),
            end: Box::new(num(1000000.0)),
            body: Box::new(Expr::Update {
                name: "total".to_string(),
                value: Box::new(binary(BinaryOp::Add, ident("total"), ident("i"))),
                span: sp(),
            }),
            parallel: true,
            span: sp(),
        },
        call("printf", vec![string("%v\n"), ident("total")]),
    ]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    let s = String::from_utf8_lossy(&bytes);
    assert!(s.contains("libpthread.so.0"));
    assert!(s.contains("pthread_create"));
}

#[test]
fn test_libm_linked_for_c_math() {
    let p = program(vec![call(
        "printf",
        vec![string("%v\n"), call("c.pow", vec![num(2.0), num(10.0)])],
    )]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    let s = String::from_utf8_lossy(&bytes);
    assert!(s.contains("libm.so.6"));
    assert!(s.contains("pow"));
}

#[test]
fn test_use_after_move_rejected_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = out_path(&dir, "moved");
    let p = program(vec![
        Expr::Define { name: "x".to_string(), value: Box::new(num(1.0)), span: sp() },
        Expr::Define {
            name: "y".to_string(),
            value: Box::new(Expr::Move { name: "x".to_string(), span: sp() }),
            span: sp(),
        },
        call("println", vec![ident("x")]),
    ]);
    let err = compile(&p, &path, "x86_64-unknown-linux-gnu", &CompileOptions::default())
        .unwrap_err();
    match err {
        CompileError::Source { report, .. } => assert!(report.contains("use after move")),
        other => panic!("expected source error, got {other}"),
    }
    assert!(!path.exists(), "no output file may be produced on failure");
}

#[test]
fn test_atomic_in_parallel_rejected_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = out_path(&dir, "atomics");
    let p = program(vec![
        Expr::DefineMut { name: "total".to_string(), value: Box::new(num(0.0)), span: sp() },
        Expr::RangeLoop {
            var: "i".to_string(),
            start: Box::new(num(0.0)),
            end: Box::new(num(100.0)),
            body: Box::new(call("atomic_add", vec![ident("total"), num(1.0)])),
            parallel: true,
            span: sp(),
        },
    ]);
    let err = compile(&p, &path, "x86_64-unknown-linux-gnu", &CompileOptions::default())
        .unwrap_err();
    match err {
        CompileError::Source { report, .. } => {
            assert!(report.contains("parallel loop"));
            assert!(report.contains("atomic"));
        }
        other => panic!("expected source error, got {other}"),
    }
    assert!(!path.exists());
}

#[test]
fn test_error_cap_aggregates_first_ten() {
    let dir = tempfile::tempdir().unwrap();
    let path = out_path(&dir, "many");
    let stmts: Vec<Expr> = (0..15).map(|i| ident(&format!("undefined_{i}"))).collect();
    let p = program(stmts);
    let err =
        compile(&p, &path, "x86_64-unknown-linux-gnu", &CompileOptions::default()).unwrap_err();
    match err {
        CompileError::Source { report, count } => {
            assert_eq!(count, 10);
            assert!(report.contains("5 more"));
        }
        other => panic!("expected source error, got {other}"),
    }
}

#[test]
fn test_pe_output_for_windows_triple() {
    let bytes = compile_to_bytes(&hello(), "x86_64-pc-windows-msvc");
    assert_eq!(&bytes[0..2], b"MZ");
    assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
}

#[test]
fn test_macho_output_for_darwin_triples() {
    for triple in ["x86_64-apple-darwin", "aarch64-apple-darwin"] {
        let bytes = compile_to_bytes(&hello(), triple);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xFEED_FACF);
    }
}

#[test]
fn test_unsupported_triple_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = out_path(&dir, "nope");
    let err =
        compile(&hello(), &path, "sparc-sun-solaris", &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedTarget { .. }));
}

#[test]
fn test_defer_and_arena_compile() {
    let p = program(vec![Expr::Arena {
        body: Box::new(Expr::Block {
            exprs: vec![
                Expr::Defer {
                    expr: Box::new(call("println", vec![string("closing")])),
                    span: sp(),
                },
                Expr::DefineMut {
                    name: "xs".to_string(),
                    value: Box::new(Expr::List { elems: vec![num(1.0)], span: sp() }),
                    span: sp(),
                },
                call("len", vec![ident("xs")]),
            ],
            span: sp(),
        }),
        span: sp(),
    }]);
    let bytes = compile_to_bytes(&p, "x86_64-unknown-linux-gnu");
    assert_eq!(&bytes[0..4], b"\x7fELF");
}

#[test]
fn test_entry_points_into_text_segment() {
    let bytes = compile_to_bytes(&hello(), "x86_64-unknown-linux-gnu");
    let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
    // Entry lands inside an executable PT_LOAD.
    let phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
    let mut inside_exec = false;
    for i in 0..6 {
        let ph = &bytes[phoff + 56 * i..phoff + 56 * (i + 1)];
        let p_type = u32::from_le_bytes(ph[0..4].try_into().unwrap());
        let p_flags = u32::from_le_bytes(ph[4..8].try_into().unwrap());
        let vaddr = u64::from_le_bytes(ph[16..24].try_into().unwrap());
        let memsz = u64::from_le_bytes(ph[40..48].try_into().unwrap());
        if p_type == 1 && p_flags & 1 != 0 && entry >= vaddr && entry < vaddr + memsz {
            inside_exec = true;
        }
    }
    assert!(inside_exec, "entry {entry:#x} not inside an RX PT_LOAD");
}
