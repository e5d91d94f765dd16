//! Detection of the running process's architecture.

use jitcap_shared::Architecture;
#[cfg(windows)]
use log::debug;

/// Architecture the JIT in this process emits code for.
///
/// On Windows this asks the OS, so an emulated process (x64 on ARM64, x86
/// under WOW64) reports what it actually runs as.
#[cfg(windows)]
pub fn current_architecture() -> Architecture {
    use jitcap_shared::arch::IMAGE_FILE_MACHINE_UNKNOWN;
    use windows::Win32::System::SystemInformation::IMAGE_FILE_MACHINE;
    use windows::Win32::System::Threading::{GetCurrentProcess, IsWow64Process2};

    let mut process_machine = IMAGE_FILE_MACHINE::default();
    let mut native_machine = IMAGE_FILE_MACHINE::default();
    let result = unsafe {
        IsWow64Process2(
            GetCurrentProcess(),
            &mut process_machine,
            Some(&mut native_machine as *mut _),
        )
    };

    if let Err(e) = result {
        debug!("IsWow64Process2 failed: {}", e);
        return Architecture::native();
    }

    // Unknown means the process is not running under WOW64.
    let machine = if process_machine.0 != IMAGE_FILE_MACHINE_UNKNOWN {
        process_machine.0
    } else {
        native_machine.0
    };

    Architecture::from_machine(machine).unwrap_or_else(|| {
        debug!("unrecognized machine type 0x{:04X}", machine);
        Architecture::native()
    })
}

/// Architecture the JIT in this process emits code for.
#[cfg(not(windows))]
pub fn current_architecture() -> Architecture {
    Architecture::native()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x64_host() {
        assert_eq!(current_architecture(), Architecture::X64);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_arm64_host() {
        assert_eq!(current_architecture(), Architecture::Arm64);
    }
}
