// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bf_types::{TlsId, TlsReg};

/// Argument and result registers of a single syscall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AbiRegs {
    pub reg0: u64,
    pub reg1: u64,
    pub reg2: u64,
    pub reg3: u64,
    pub reg4: u64,
    pub reg5: u64,
}

impl AbiRegs {
    /// Registers for a syscall made with `handle`, plus up to five
    /// arguments in `reg1` onward.
    pub fn with_handle(handle: u64, args: &[u64]) -> Self {
        let mut regs = Self { reg0: handle, ..Default::default() };
        let slots = [
            &mut regs.reg1,
            &mut regs.reg2,
            &mut regs.reg3,
            &mut regs.reg4,
            &mut regs.reg5,
        ];
        for (slot, arg) in slots.into_iter().zip(args) {
            *slot = *arg;
        }
        regs
    }
}

/// How an extension reaches the microkernel: the trap itself and the
/// extension's TLS block.
#[cfg_attr(test, mockall::automock)]
pub trait SyscallAbi {
    /// Issue syscall `word`. Result registers are written back into `regs`
    /// and the raw status is returned.
    fn trap(&mut self, word: u64, regs: &mut AbiRegs) -> u64;

    fn tls_reg(&self, reg: TlsReg) -> u64;

    fn set_tls_reg(&mut self, reg: TlsReg, val: u64);

    fn tls_id(&self, id: TlsId) -> u16;
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The `syscall` instruction, as seen from an extension running on
        /// the microkernel.
        ///
        /// The syscall word goes in `rax`, and `reg0..reg5` in `r10`,
        /// `rdi`, `rsi`, `rdx`, `r8` and `r9`. The status comes back in
        /// `rax`.
        #[derive(Debug)]
        pub struct HwAbi {
            tls: *mut u8,
        }

        impl HwAbi {
            /// # Safety
            ///
            /// `tls` must point at the extension TLS block the microkernel
            /// mapped for this extension, and the caller must be running as
            /// that extension.
            pub unsafe fn new(tls: *mut u8) -> Self {
                Self { tls }
            }
        }

        impl SyscallAbi for HwAbi {
            fn trap(&mut self, word: u64, regs: &mut AbiRegs) -> u64 {
                let status: u64;
                // SAFETY: the microkernel preserves every register other
                // than the ones named here.
                unsafe {
                    std::arch::asm!(
                        "syscall",
                        inout("rax") word => status,
                        inout("r10") regs.reg0,
                        inout("rdi") regs.reg1,
                        inout("rsi") regs.reg2,
                        inout("rdx") regs.reg3,
                        inout("r8") regs.reg4,
                        inout("r9") regs.reg5,
                        out("rcx") _,
                        out("r11") _,
                        options(nostack),
                    );
                }
                status
            }

            fn tls_reg(&self, reg: TlsReg) -> u64 {
                // SAFETY: guaranteed by the contract of HwAbi::new
                unsafe {
                    self.tls
                        .add(reg.offset() as usize)
                        .cast::<u64>()
                        .read_volatile()
                }
            }

            fn set_tls_reg(&mut self, reg: TlsReg, val: u64) {
                // SAFETY: guaranteed by the contract of HwAbi::new
                unsafe {
                    self.tls
                        .add(reg.offset() as usize)
                        .cast::<u64>()
                        .write_volatile(val)
                }
            }

            fn tls_id(&self, id: TlsId) -> u16 {
                // SAFETY: guaranteed by the contract of HwAbi::new
                unsafe {
                    self.tls
                        .add(id.offset() as usize)
                        .cast::<u16>()
                        .read_volatile()
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_handle_fills_in_order() {
        let regs = AbiRegs::with_handle(7, &[1, 2, 3]);
        assert_eq!(
            regs,
            AbiRegs { reg0: 7, reg1: 1, reg2: 2, reg3: 3, reg4: 0, reg5: 0 }
        );
    }

    #[test]
    fn extra_arguments_are_dropped() {
        let regs = AbiRegs::with_handle(0, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.reg5, 5);
    }
}
