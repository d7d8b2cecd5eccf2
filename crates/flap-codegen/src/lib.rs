//! flap-codegen: the machine-code emission core of the Flap compiler
//!
//! This crate owns everything between the typed AST and raw segment bytes:
//! the byte sink with labeled positions and deferred patches, the per-ISA
//! register model, the three instruction encoders (x86-64, ARM64,
//! RISC-V 64), the runtime helper library emitted ahead of user code, the
//! two-pass AST translator, and the symbol/address table. Object-file
//! concerns (dynamic linking tables, container formats) live in
//! `flap-obj`; the driver that sequences the two passes lives in `flapc`.

pub mod diagnostics;
pub mod error;
pub mod helpers;
pub mod isa;
pub mod regs;
pub mod sink;
pub mod symtab;
pub mod translator;
pub mod value;

pub use diagnostics::{Diagnostic, Diagnostics};
pub use error::{EmitError, EmitResult};
pub use helpers::{HelperLib, SimdLevel};
pub use isa::{Cond, Emitter, Isa};
pub use sink::{ByteSink, Patch, PatchKind};
pub use symtab::{Segment, SymbolTable};
pub use translator::Translator;

#[cfg(test)]
mod tests {
    use super::*;
    use flap_ast::{Expr, Program, Span};

    fn sp() -> Span {
        Span::new(1, 1)
    }

    fn hello_program() -> Program {
        Program {
            file: "hello.flap".to_string(),
            stmts: vec![Expr::Call {
                name: "println".to_string(),
                args: vec![Expr::Str { value: "Hello, World!".to_string(), span: sp() }],
                span: sp(),
            }],
            imports: vec![],
        }
    }

    fn emit_once(isa: Isa, program: &Program) -> ByteSink {
        let mut tr = Translator::new(isa, SimdLevel::Scalar, program);
        tr.collect().unwrap();
        assert!(!tr.diagnostics().has_errors(), "{}", tr.diagnostics().report());
        let mut text = ByteSink::new(Segment::Text);
        tr.emit(&mut text).unwrap();
        text
    }

    #[test]
    fn test_hello_emits_on_all_isas() {
        let program = hello_program();
        for isa in [Isa::X86_64, Isa::Aarch64, Isa::Riscv64] {
            let text = emit_once(isa, &program);
            assert!(text.label_offset("_start").is_some());
            assert!(text.label_offset("_flap_main").is_some());
            assert!(text.label_offset("_flap_itoa").is_some());
            assert!(text.position() > 0);
        }
    }

    #[test]
    fn test_two_pass_emission_is_byte_identical() {
        let program = hello_program();
        let mut tr = Translator::new(Isa::X86_64, SimdLevel::Scalar, &program);
        tr.collect().unwrap();

        let mut first = ByteSink::new(Segment::Text);
        tr.emit(&mut first).unwrap();

        tr.reset_emission();
        let mut second = ByteSink::new(Segment::Text);
        tr.emit(&mut second).unwrap();

        assert_eq!(first.bytes(), second.bytes());
        let mut a: Vec<(&str, usize)> = first.labels().collect();
        let mut b: Vec<(&str, usize)> = second.labels().collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fib_tail_recursion_emits() {
        use flap_ast::{BinaryOp, Lambda, MatchArm};
        // fib(n, a, b) = match n == 0 -> a, default -> fib(n-1, b, a+b)
        let fib_body = Expr::Match {
            arms: vec![MatchArm {
                guard: Expr::Binary {
                    op: BinaryOp::Eq,
                    lhs: Box::new(Expr::Ident { name: "n".to_string(), span: sp() }),
                    rhs: Box::new(Expr::Number { value: 0.0, span: sp() }),
                    span: sp(),
                },
                body: Expr::Ident { name: "a".to_string(), span: sp() },
            }],
            default: Some(Box::new(Expr::Call {
                name: "fib".to_string(),
                args: vec![
                    Expr::Binary {
                        op: BinaryOp::Sub,
                        lhs: Box::new(Expr::Ident { name: "n".to_string(), span: sp() }),
                        rhs: Box::new(Expr::Number { value: 1.0, span: sp() }),
                        span: sp(),
                    },
                    Expr::Ident { name: "b".to_string(), span: sp() },
                    Expr::Binary {
                        op: BinaryOp::Add,
                        lhs: Box::new(Expr::Ident { name: "a".to_string(), span: sp() }),
                        rhs: Box::new(Expr::Ident { name: "b".to_string(), span: sp() }),
                        span: sp(),
                    },
                ],
                span: sp(),
            })),
            span: sp(),
        };
        let program = Program {
            file: "fib.flap".to_string(),
            stmts: vec![
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
                Expr::Call {
                    name: "printf".to_string(),
                    args: vec![
                        Expr::Str { value: "%v\n".to_string(), span: sp() },
                        Expr::Call {
                            name: "fib".to_string(),
                            args: vec![
                                Expr::Number { value: 10.0, span: sp() },
                                Expr::Number { value: 0.0, span: sp() },
                                Expr::Number { value: 1.0, span: sp() },
                            ],
                            span: sp(),
                        },
                    ],
                    span: sp(),
                },
            ],
            imports: vec![],
        };
        let text = emit_once(Isa::X86_64, &program);
        assert!(text.label_offset("fib").is_some());
        assert!(text.label_offset("fib.body").is_some());
    }

    #[test]
    fn test_parallel_sum_emits_worker_and_barrier_call() {
        use flap_ast::BinaryOp;
        let program = Program {
            file: "psum.flap".to_string(),
            stmts: vec![
                Expr::DefineMut {
                    name: "total".to_string(),
                    value: Box::new(Expr::Number { value: 0.0, span: sp() }),
                    span: sp(),
                },
                Expr::RangeLoop {
                    var: "i".to_string(),
                    start: Box::new(Expr::Number { value: 0.0, span: sp() }),
                    end: Box::new(Expr::Number { value: 1000000.0, span: sp() }),
                    body: Box::new(Expr::Update {
                        name: "total".to_string(),
                        value: Box::new(Expr::Binary {
                            op: BinaryOp::Add,
                            lhs: Box::new(Expr::Ident { name: "total".to_string(), span: sp() }),
                            rhs: Box::new(Expr::Ident { name: "i".to_string(), span: sp() }),
                            span: sp(),
                        }),
                        span: sp(),
                    }),
                    parallel: true,
                    span: sp(),
                },
            ],
            imports: vec![],
        };
        let text = emit_once(Isa::X86_64, &program);
        assert!(text.label_offset("__par_0").is_some());
        // The worker body ends in a barrier call patch.
        assert!(text.patches().iter().any(|p| p.symbol == "_flap_parallel_barrier"));
        assert!(text.patches().iter().any(|p| p.symbol == "pthread_create@plt"));
    }
}
