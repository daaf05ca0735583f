//! Loader tests: entry state and the initial stack image.

use mcsim_core::context::ContextList;
use mcsim_core::loader::Loader;
use mcsim_core::Emu;

use crate::common::elf::{mips_program, MIPS_BASE};
use crate::common::init;

fn loader_for(path: String) -> Loader {
    Loader {
        exe: path.clone(),
        args: vec![path, "alpha".into(), "beta".into()],
        env: vec!["TERM=dumb".into(), "LANG=C".into()],
        cwd: "/tmp".into(),
        ..Loader::default()
    }
}

/// The initial stack holds argc, argv/envp pointer arrays with NUL
/// terminators, and an auxiliary vector ending in AT_NULL; the strings
/// are reachable through the pointers.
#[test]
fn stack_image_layout() {
    init();
    let program = mips_program(&[0x0000_000c], &[]);
    let mut emu = Emu::new();
    let pid = emu.load(loader_for(program.path())).unwrap();

    let ctx = emu.context(pid).unwrap();
    assert_eq!(ctx.regs.pc(), MIPS_BASE, "entry at e_entry");

    let sp = ctx.regs.sp();
    let mem = ctx.memory.clone();
    let mut mem = mem.borrow_mut();

    // argc and argv.
    assert_eq!(mem.read_u32(sp).unwrap(), 3);
    let argv0 = mem.read_u32(sp + 4).unwrap();
    let argv1 = mem.read_u32(sp + 8).unwrap();
    let argv2 = mem.read_u32(sp + 12).unwrap();
    assert_eq!(mem.read_u32(sp + 16).unwrap(), 0, "argv NULL terminator");
    assert_eq!(mem.read_string(argv0).unwrap(), program.path());
    assert_eq!(mem.read_string(argv1).unwrap(), "alpha");
    assert_eq!(mem.read_string(argv2).unwrap(), "beta");

    // envp.
    let envp0 = mem.read_u32(sp + 20).unwrap();
    let envp1 = mem.read_u32(sp + 24).unwrap();
    assert_eq!(mem.read_u32(sp + 28).unwrap(), 0, "envp NULL terminator");
    assert_eq!(mem.read_string(envp0).unwrap(), "TERM=dumb");
    assert_eq!(mem.read_string(envp1).unwrap(), "LANG=C");

    // Auxiliary vector: scan for AT_PAGESZ, AT_ENTRY, AT_RANDOM, AT_NULL.
    let mut at = sp + 32;
    let mut seen_pagesz = false;
    let mut seen_entry = false;
    let mut random_ptr = 0;
    loop {
        let key = mem.read_u32(at).unwrap();
        let value = mem.read_u32(at + 4).unwrap();
        match key {
            0 => break, // AT_NULL
            6 => {
                assert_eq!(value, 4096);
                seen_pagesz = true;
            }
            9 => {
                assert_eq!(value, MIPS_BASE);
                seen_entry = true;
            }
            25 => random_ptr = value,
            _ => {}
        }
        at += 8;
    }
    assert!(seen_pagesz && seen_entry);

    // AT_RANDOM points at 16 readable bytes.
    assert_ne!(random_ptr, 0);
    let mut random = [0u8; 16];
    mem.read(random_ptr, &mut random).unwrap();
    assert_ne!(random, [0u8; 16]);
}

/// The loader records heap geometry: the break starts page-aligned above
/// the image top.
#[test]
fn heap_break_above_image() {
    init();
    let program = mips_program(&[0x0000_000c], &[1, 2, 3]);
    let mut emu = Emu::new();
    let pid = emu.load(loader_for(program.path())).unwrap();

    let ctx = emu.context(pid).unwrap();
    let brk = ctx.memory.borrow().heap_break();
    assert_eq!(brk % 4096, 0);
    assert!(brk > MIPS_BASE);
    assert_eq!(emu.list(ContextList::Running), &[pid]);
}

/// A 64-bit or wrong-machine binary is rejected with a diagnostic, not
/// loaded halfway.
#[test]
fn rejects_bad_binaries() {
    init();
    let mut emu = Emu::new();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-an-elf");
    std::fs::write(&path, b"#!/bin/sh\necho no\n").unwrap();

    let err = emu
        .load(Loader {
            exe: path.display().to_string(),
            args: vec!["x".into()],
            ..Loader::default()
        })
        .unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("bad executable"), "got: {}", msg);
}
