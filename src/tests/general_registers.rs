//! Tests for GeneralRegisters structure.

use crate::regs::GeneralRegisters;
use crate::uapi::KvmRegs;

#[test]
fn test_general_registers_default() {
    let regs = GeneralRegisters::default();
    assert_eq!(regs.rax, 0);
    assert_eq!(regs.rcx, 0);
    assert_eq!(regs.rdx, 0);
    assert_eq!(regs.rbx, 0);
    assert_eq!(regs.rbp, 0);
    assert_eq!(regs.rsi, 0);
    assert_eq!(regs.rdi, 0);
    assert_eq!(regs.r8, 0);
    assert_eq!(regs.r15, 0);
}

#[test]
fn test_general_registers_eq() {
    let regs1 = GeneralRegisters::default();
    let regs2 = GeneralRegisters::default();
    assert_eq!(regs1, regs2);

    let mut regs3 = GeneralRegisters::default();
    regs3.rax = 1;
    assert_ne!(regs1, regs3);
}

#[test]
fn test_from_kvm_regs() {
    let kvm = KvmRegs {
        rax: 1,
        rbx: 2,
        rcx: 3,
        rdx: 4,
        rsi: 5,
        rdi: 6,
        rsp: 7,
        rbp: 8,
        r8: 9,
        r15: 16,
        rip: 0x1000,
        rflags: 0x202,
        ..Default::default()
    };
    let regs = GeneralRegisters::from_kvm(&kvm);
    assert_eq!(regs.rax, 1);
    assert_eq!(regs.rbx, 2);
    assert_eq!(regs.rcx, 3);
    assert_eq!(regs.rdx, 4);
    assert_eq!(regs.rbp, 8);
    assert_eq!(regs.r8, 9);
    assert_eq!(regs.r15, 16);
}

#[test]
fn test_store_kvm_keeps_vmcs_registers() {
    let mut kvm = KvmRegs {
        rsp: 0x8000,
        rip: 0x1000,
        rflags: 0x202,
        ..Default::default()
    };
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xaa;
    regs.r12 = 0xcc;
    regs.store_kvm(&mut kvm);
    assert_eq!(kvm.rax, 0xaa);
    assert_eq!(kvm.r12, 0xcc);
    assert_eq!(kvm.rsp, 0x8000);
    assert_eq!(kvm.rip, 0x1000);
    assert_eq!(kvm.rflags, 0x202);
}
