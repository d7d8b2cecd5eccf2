//! Two-pass assembly
//!
//! The address-resolution machinery, in the fixed order everything else
//! depends on:
//!
//! 1. first emission (collect + pass-two codegen against unplaced
//!    symbols, recording patch requests);
//! 2. dynamic-link tables from the collected import set;
//! 3. layout: final segment bases from header sizes and page alignment;
//! 4. translator reset - every counter, map, and moved-set recreated;
//! 5. second emission, byte-identical in shape to the first;
//! 6. patching: PLT calls, then pc-relative data references;
//! 7. (dynsym values would update here if lambdas were exported);
//! 8. container serialization.
//!
//! The invariant that makes this work: the second pass is a pure function
//! of the AST and the final address map. Step 4 is where that is earned.

use crate::error::{CompileError, CompileResult};
use crate::options::CompileOptions;
use crate::target::{ObjectFormat, Target};
use crate::CompileReport;
use flap_codegen::{isa::plt_label, ByteSink, Isa, Segment, SymbolTable, Translator};
use flap_obj::{dynlink::DynLinkBuilder, elf, layout, libs, macho, pe};
use flap_ast::Program;
use log::debug;
use std::path::Path;

pub(crate) fn run(
    program: &Program,
    output_path: &Path,
    target: Target,
    options: &CompileOptions,
) -> CompileResult<CompileReport> {
    let isa = target.isa;

    // ---- collection + source checks ----
    let mut tr = Translator::new(isa, options.simd, program);
    tr.collect()?;
    if tr.diagnostics().has_errors() {
        return Err(CompileError::Source {
            report: tr.diagnostics().report(),
            count: tr.diagnostics().len(),
        });
    }

    // ---- first emission ----
    debug!("pass 1: first emission");
    let mut text_a = ByteSink::new(Segment::Text);
    tr.emit(&mut text_a)?;

    // ---- rodata / data images, sorted-name order for determinism ----
    let mut rodata_items = tr.rodata_items();
    rodata_items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rodata_sink = ByteSink::new(Segment::Rodata);
    let mut rodata_symbols = Vec::new();
    for (name, bytes) in &rodata_items {
        rodata_sink.align_to(8);
        rodata_symbols.push((name.clone(), rodata_sink.position(), bytes.len()));
        rodata_sink.write_bytes(bytes);
    }

    let mut data_items = tr.data_items();
    data_items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut data_symbols = Vec::new();
    let mut data_size = 0usize;
    for (name, size) in &data_items {
        data_size = (data_size + 7) & !7;
        data_symbols.push((name.clone(), data_size, *size));
        data_size += size;
    }
    let data_bytes = vec![0u8; data_size];

    // ---- imports and libraries ----
    let imports = tr.extern_imports();
    let user_libs: Vec<String> = program.imports.iter().map(|i| i.lib.clone()).collect();
    let libraries = libs::needed_libraries(tr.uses_parallel(), tr.uses_libm(), &user_libs)?;
    debug!("imports: {imports:?}, NEEDED: {libraries:?}");

    // ---- second emission against the final layout ----
    debug!("pass 2: reset and re-emit");
    tr.reset_emission();
    let mut text = ByteSink::new(Segment::Text);
    tr.emit(&mut text)?;
    if text.position() != text_a.position() {
        return Err(flap_codegen::EmitError::Internal {
            message: format!(
                "two-pass divergence: {} vs {} text bytes",
                text_a.position(),
                text.position()
            ),
        }
        .into());
    }

    // ---- format-specific layout, patching, serialization ----
    let image = match target.format {
        ObjectFormat::Elf => link_elf(
            isa,
            &mut text,
            &rodata_sink,
            &rodata_symbols,
            &data_bytes,
            &data_symbols,
            imports.clone(),
            libraries,
        )?,
        ObjectFormat::Pe => link_pe(
            isa,
            &mut text,
            &rodata_sink,
            &rodata_symbols,
            &data_bytes,
            &data_symbols,
            &imports,
        )?,
        ObjectFormat::MachO => link_macho(
            isa,
            &mut text,
            &rodata_sink,
            &rodata_symbols,
            &data_bytes,
            &data_symbols,
            &imports,
        )?,
    };

    write_output(output_path, &image)?;
    Ok(CompileReport {
        image_bytes: image.len(),
        text_bytes: text.position(),
        imports: imports.len(),
    })
}

/// Populate the symbol table common to every format: text labels, plt
/// trampolines, rodata and data cells, with their segment bases.
#[allow(clippy::too_many_arguments)]
fn build_symtab(
    text: &ByteSink,
    rodata_symbols: &[(String, usize, usize)],
    data_symbols: &[(String, usize, usize)],
    plt_offsets: &[(String, usize)],
    text_base: u64,
    plt_base: u64,
    rodata_base: u64,
    data_base: u64,
) -> CompileResult<SymbolTable> {
    let mut symtab = SymbolTable::new();
    symtab.import_labels(text)?;
    for (sym, off) in plt_offsets {
        symtab.define_label(&plt_label(sym), Segment::Plt, *off)?;
    }
    for (name, off, size) in rodata_symbols {
        symtab.define(name, Segment::Rodata, *off, *size)?;
    }
    for (name, off, size) in data_symbols {
        symtab.define(name, Segment::Data, *off, *size)?;
    }
    symtab.assign_base(Segment::Text, text_base);
    symtab.assign_base(Segment::Plt, plt_base);
    symtab.assign_base(Segment::Rodata, rodata_base);
    symtab.assign_base(Segment::Data, data_base);
    Ok(symtab)
}

fn apply_patches(isa: Isa, text: &mut ByteSink, symtab: &SymbolTable, text_base: u64) -> CompileResult<()> {
    let emitter = isa.emitter();
    text.patch_all(
        text_base,
        |name| symtab.resolve(name).ok(),
        |code, patch, target, base| emitter.apply_patch(code, patch, target, base),
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn link_elf(
    isa: Isa,
    text: &mut ByteSink,
    rodata_sink: &ByteSink,
    rodata_symbols: &[(String, usize, usize)],
    data_bytes: &[u8],
    data_symbols: &[(String, usize, usize)],
    imports: Vec<String>,
    libraries: Vec<String>,
) -> CompileResult<Vec<u8>> {
    let dynbuilder = DynLinkBuilder::new(isa, imports, libraries);
    let sizes = dynbuilder.sizes();
    let l = layout::Layout::compute(&layout::SectionSizes {
        interp: elf::interp_path(isa).len(),
        dynsym: sizes.dynsym,
        dynstr: sizes.dynstr,
        hash: sizes.hash,
        rela_plt: sizes.rela_plt,
        plt: sizes.plt,
        text: text.position(),
        dynamic: sizes.dynamic,
        got_plt: sizes.got_plt,
        rodata: rodata_sink.position(),
        data: data_bytes.len(),
        bss: 0,
    });
    debug!(
        "layout: text {:#x}, plt {:#x}, rodata {:#x}, data {:#x}",
        l.text.addr, l.plt.addr, l.rodata.addr, l.data.addr
    );

    let tables = dynbuilder.build(&flap_obj::DynLinkAddrs {
        dynstr: l.dynstr.addr,
        dynsym: l.dynsym.addr,
        hash: l.hash.addr,
        rela_plt: l.rela_plt.addr,
        plt: l.plt.addr,
        got_plt: l.got_plt.addr,
        dynamic: l.dynamic.addr,
    });

    let symtab = build_symtab(
        text,
        rodata_symbols,
        data_symbols,
        &tables.plt_offsets,
        l.text.addr,
        l.plt.addr,
        l.rodata.addr,
        l.data.addr,
    )?;
    apply_patches(isa, text, &symtab, l.text.addr)?;

    let entry = symtab.resolve("_start")?;
    let image = elf::write(&elf::ElfImage {
        isa,
        layout: l,
        entry,
        plt: &tables.plt,
        text: text.bytes(),
        rodata: rodata_sink.bytes(),
        data: data_bytes,
        dynsym: &tables.dynsym,
        dynstr: &tables.dynstr,
        hash: &tables.hash,
        rela_plt: &tables.rela_plt,
        dynamic: &tables.dynamic,
        got_plt: &tables.got_plt,
    })?;
    Ok(image)
}

fn link_pe(
    isa: Isa,
    text: &mut ByteSink,
    rodata_sink: &ByteSink,
    rodata_symbols: &[(String, usize, usize)],
    data_bytes: &[u8],
    data_symbols: &[(String, usize, usize)],
    imports: &[String],
) -> CompileResult<Vec<u8>> {
    let plan = pe::plan(isa, imports, text.position(), rodata_sink.position())?;
    let symtab = build_symtab(
        text,
        rodata_symbols,
        data_symbols,
        &plan.plt_offsets,
        plan.text_addr,
        plan.plt_addr,
        plan.rodata_addr,
        plan.data_addr,
    )?;
    apply_patches(isa, text, &symtab, plan.text_addr)?;
    let entry = symtab.resolve("_start")?;
    let image = pe::write(&plan, text.bytes(), rodata_sink.bytes(), data_bytes, entry)?;
    Ok(image)
}

fn link_macho(
    isa: Isa,
    text: &mut ByteSink,
    rodata_sink: &ByteSink,
    rodata_symbols: &[(String, usize, usize)],
    data_bytes: &[u8],
    data_symbols: &[(String, usize, usize)],
    imports: &[String],
) -> CompileResult<Vec<u8>> {
    let plan = macho::plan(isa, imports, text.position(), rodata_sink.position())?;
    let symtab = build_symtab(
        text,
        rodata_symbols,
        data_symbols,
        &plan.plt_offsets,
        plan.text_addr,
        plan.plt_addr,
        plan.rodata_addr,
        plan.data_addr,
    )?;
    apply_patches(isa, text, &symtab, plan.text_addr)?;
    let entry = symtab.resolve("_start")?;
    let image = macho::write(isa, &plan, text.bytes(), rodata_sink.bytes(), data_bytes, entry)?;
    Ok(image)
}

fn write_output(path: &Path, image: &[u8]) -> CompileResult<()> {
    std::fs::write(path, image).map_err(|source| CompileError::Output {
        path: path.display().to_string(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(
            |source| CompileError::Output { path: path.display().to_string(), source },
        )?;
    }
    Ok(())
}
