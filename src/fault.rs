//! Contract-violation reporting.
//!
//! The kernel distinguishes two error tiers: expected runtime conditions
//! (full queue under a margin, elapsed timeout, cancelled delay) surface as
//! ordinary return values, while contract violations (bad call context,
//! reused priority, double blocking, rearming an armed timer) funnel through
//! the single [`fault`] hook and halt the program. Each call site carries
//! the module identifier and a numeric location code so a crash can be
//! traced without symbols.

use thiserror::Error;

/// Payload carried by the fatal path.
#[derive(Debug, Clone, Error)]
#[error("kernel contract violation in module '{module}' (location {location})")]
pub struct ContractViolation {
    pub module: &'static str,
    pub location: u32,
}

/// Reports a contract violation and aborts.
///
/// Violations are programmer or configuration errors caught at integration
/// time; they are never recoverable at runtime.
#[cold]
pub fn fault(module: &'static str, location: u32) -> ! {
    let violation = ContractViolation { module, location };
    log::error!("{violation}");
    panic!("{violation}");
}

/// Precondition check, fatal on failure.
macro_rules! krequire {
    ($module:expr, $location:expr, $cond:expr) => {
        if !$cond {
            $crate::fault::fault($module, $location);
        }
    };
}

/// Unconditional contract violation.
macro_rules! kfault {
    ($module:expr, $location:expr) => {
        $crate::fault::fault($module, $location)
    };
}

pub(crate) use kfault;
pub(crate) use krequire;
