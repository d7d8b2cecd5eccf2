//! flap-obj: object-file backends for the Flap compiler
//!
//! Everything between finished segment bytes and a loadable executable:
//! the dynamic-link table builder (dynstr/dynsym/hash/rela.plt/.plt/
//! .got.plt/.dynamic), the page-granular image layout, NEEDED-library
//! resolution, and the three container writers (ELF64, PE32+, Mach-O).

pub mod dynlink;
pub mod elf;
pub mod error;
pub mod layout;
pub mod libs;
pub mod macho;
pub mod pe;

pub use dynlink::{DynLinkAddrs, DynLinkBuilder, DynLinkSizes, DynLinkTables};
pub use error::{ObjectError, ObjectResult};
pub use layout::{Layout, Placed, SectionSizes};
