/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small, dependency-light helpers shared by the sync engine for turning an
//! internal error into a public one while consistently logging and (when an
//! application has installed one) reporting it. Nothing here knows about
//! SQL or HTTP; it is pure error-handling plumbing.

pub mod handling;
pub mod redact;
pub mod reporting;

pub use handling::{ErrorHandling, ErrorReporting, GetErrorHandling};
pub use reporting::{set_application_error_reporter, unset_application_error_reporter};

/// Convenience re-export so call sites can write `error_support::handle_error!(e)`
/// without importing `handling` directly.
#[macro_export]
macro_rules! handle_error {
    ($err:expr) => {
        $crate::handling::convert_log_report_error($err)
    };
}
