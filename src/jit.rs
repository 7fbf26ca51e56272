use std::ffi::{CStr, CString};
use std::ptr::null_mut;
use std::sync::Once;

use llvm_sys::error::{LLVMDisposeErrorMessage, LLVMErrorRef, LLVMGetErrorMessage};
use llvm_sys::orc2::lljit;
use llvm_sys::orc2::{
    self, LLVMJITEvaluatedSymbol, LLVMJITSymbolFlags, LLVMJITSymbolGenericFlags,
    LLVMJITCSymbolMapPair,
};
use llvm_sys::target;

use super::error::{Error, ErrorKind};

static TARGET_INIT: Once = Once::new();

/// `putchard(x)` writes x as a character to stderr and returns 0.
extern "C" fn putchard(x: f64) -> f64 {
    eprint!("{}", x as u8 as char);
    0.0
}

/// `printd(x)` writes x and a backspace to stderr and returns 0.
extern "C" fn printd(x: f64) -> f64 {
    eprint!("{:.6}\u{8}", x);
    0.0
}

unsafe fn llvm_err(err: LLVMErrorRef) -> Result<(), Error> {
    if err.is_null() {
        return Ok(());
    }
    let msg = LLVMGetErrorMessage(err);
    let s = CStr::from_ptr(msg).to_string_lossy().into_owned();
    LLVMDisposeErrorMessage(msg);
    Err(Error::from(ErrorKind::Jit(s)))
}

/// Execution session: an ORC LLJIT instance whose main dylib resolves
/// process symbols and carries the two host functions.
pub(crate) struct Jit {
    lljit: lljit::LLVMOrcLLJITRef,
    dylib: orc2::LLVMOrcJITDylibRef,
}

impl Jit {
    pub(crate) unsafe fn new() -> Result<Jit, Error> {
        TARGET_INIT.call_once(|| unsafe {
            target::LLVM_InitializeNativeTarget();
            target::LLVM_InitializeNativeAsmPrinter();
            target::LLVM_InitializeNativeAsmParser();
        });

        let mut jit: lljit::LLVMOrcLLJITRef = null_mut();
        llvm_err(lljit::LLVMOrcCreateLLJIT(&mut jit, null_mut()))?;
        let dylib = lljit::LLVMOrcLLJITGetMainJITDylib(jit);

        let mut generator: orc2::LLVMOrcDefinitionGeneratorRef = null_mut();
        llvm_err(orc2::LLVMOrcCreateDynamicLibrarySearchGeneratorForProcess(
            &mut generator,
            lljit::LLVMOrcLLJITGetGlobalPrefix(jit),
            None,
            null_mut(),
        ))?;
        orc2::LLVMOrcJITDylibAddGenerator(dylib, generator);

        let jit = Jit { lljit: jit, dylib };
        jit.define_host_symbol("putchard", putchard as usize as u64)?;
        jit.define_host_symbol("printd", printd as usize as u64)?;
        Ok(jit)
    }

    unsafe fn define_host_symbol(&self, name: &str, addr: u64) -> Result<(), Error> {
        let cname = CString::new(name).unwrap();
        let flags = LLVMJITSymbolFlags {
            GenericFlags: LLVMJITSymbolGenericFlags::LLVMJITSymbolGenericFlagsExported as u8
                | LLVMJITSymbolGenericFlags::LLVMJITSymbolGenericFlagsCallable as u8,
            TargetFlags: 0,
        };
        let mut pairs = [LLVMJITCSymbolMapPair {
            Name: lljit::LLVMOrcLLJITMangleAndIntern(self.lljit, cname.as_ptr()),
            Sym: LLVMJITEvaluatedSymbol {
                Address: addr,
                Flags: flags,
            },
        }];
        let unit = orc2::LLVMOrcAbsoluteSymbols(pairs.as_mut_ptr(), pairs.len());
        llvm_err(orc2::LLVMOrcJITDylibDefine(self.dylib, unit))
    }

    pub(crate) unsafe fn data_layout(&self) -> &CStr {
        CStr::from_ptr(lljit::LLVMOrcLLJITGetDataLayoutStr(self.lljit))
    }

    /// Definitions stay for the life of the process.
    pub(crate) unsafe fn add_module(
        &self,
        module: orc2::LLVMOrcThreadSafeModuleRef,
    ) -> Result<(), Error> {
        llvm_err(lljit::LLVMOrcLLJITAddLLVMIRModule(
            self.lljit, self.dylib, module,
        ))
    }

    /// Anonymous expressions go in under their own tracker so removing it
    /// discards the module and frees the symbol for the next one.
    pub(crate) unsafe fn add_module_with_tracker(
        &self,
        module: orc2::LLVMOrcThreadSafeModuleRef,
    ) -> Result<ResourceTracker, Error> {
        let tracker = orc2::LLVMOrcJITDylibCreateResourceTracker(self.dylib);
        if let Err(e) = llvm_err(lljit::LLVMOrcLLJITAddLLVMIRModuleWithRT(
            self.lljit, tracker, module,
        )) {
            orc2::LLVMOrcReleaseResourceTracker(tracker);
            return Err(e);
        }
        Ok(ResourceTracker(tracker))
    }

    /// Triggers lazy compilation and returns the symbol's address.
    pub(crate) unsafe fn lookup(&self, name: &str) -> Result<u64, Error> {
        let cname = CString::new(name).unwrap();
        let mut addr: orc2::LLVMOrcExecutorAddress = 0;
        llvm_err(lljit::LLVMOrcLLJITLookup(
            self.lljit,
            &mut addr,
            cname.as_ptr(),
        ))?;
        Ok(addr)
    }
}

pub(crate) struct ResourceTracker(orc2::LLVMOrcResourceTrackerRef);

impl ResourceTracker {
    pub(crate) unsafe fn remove(self) -> Result<(), Error> {
        let result = llvm_err(orc2::LLVMOrcResourceTrackerRemove(self.0));
        orc2::LLVMOrcReleaseResourceTracker(self.0);
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_symbols() {
        unsafe {
            let jit = Jit::new().unwrap();
            assert_ne!(jit.lookup("putchard").unwrap(), 0);
            assert_ne!(jit.lookup("printd").unwrap(), 0);
        }
    }

    #[test]
    fn test_unknown_symbol() {
        unsafe {
            let jit = Jit::new().unwrap();
            assert!(jit.lookup("no_such_symbol_anywhere").is_err());
        }
    }
}
