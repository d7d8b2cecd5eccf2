//! Target triple handling

use crate::error::{CompileError, CompileResult};
use flap_codegen::Isa;
use std::str::FromStr;
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// Output container format, selected by the triple's OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    Pe,
    MachO,
}

#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub isa: Isa,
    pub format: ObjectFormat,
}

impl Target {
    /// `host` selects the compiling machine's triple.
    pub fn parse(triple: &str) -> CompileResult<Target> {
        let triple = if triple == "host" {
            Triple::host()
        } else {
            Triple::from_str(triple)
                .map_err(|_| CompileError::UnsupportedTarget { triple: triple.to_string() })?
        };
        let isa = match triple.architecture {
            Architecture::X86_64 => Isa::X86_64,
            Architecture::Aarch64(_) => Isa::Aarch64,
            Architecture::Riscv64(_) => Isa::Riscv64,
            _ => {
                return Err(CompileError::UnsupportedTarget { triple: triple.to_string() });
            }
        };
        let format = match triple.operating_system {
            OperatingSystem::Linux => ObjectFormat::Elf,
            OperatingSystem::Windows => ObjectFormat::Pe,
            OperatingSystem::Darwin(_) | OperatingSystem::MacOSX(_) => ObjectFormat::MachO,
            _ => {
                return Err(CompileError::UnsupportedTarget { triple: triple.to_string() });
            }
        };
        Ok(Target { isa, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_triples() {
        let t = Target::parse("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(t.isa, Isa::X86_64);
        assert_eq!(t.format, ObjectFormat::Elf);

        let t = Target::parse("aarch64-unknown-linux-gnu").unwrap();
        assert_eq!(t.isa, Isa::Aarch64);

        let t = Target::parse("riscv64gc-unknown-linux-gnu").unwrap();
        assert_eq!(t.isa, Isa::Riscv64);
    }

    #[test]
    fn test_windows_and_macos() {
        let t = Target::parse("x86_64-pc-windows-msvc").unwrap();
        assert_eq!(t.format, ObjectFormat::Pe);

        let t = Target::parse("aarch64-apple-darwin").unwrap();
        assert_eq!(t.format, ObjectFormat::MachO);
    }

    #[test]
    fn test_unsupported_rejected() {
        assert!(Target::parse("mips-unknown-linux-gnu").is_err());
        assert!(Target::parse("not a triple").is_err());
    }
}
