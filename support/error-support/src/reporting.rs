/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A pluggable sink for "this is worth surfacing to the app's crash/error
//! reporter" events. The sync engine is a library; it never assumes Sentry,
//! Glean, or anything else is present, so it reports through this trait and
//! ships a no-op default.

use parking_lot::RwLock;

/// Application error reporting trait. A host application implements this
/// and installs it with `set_application_error_reporter`.
pub trait ApplicationErrorReporter: Sync + Send {
    /// Send an error report to a Sentry-like error reporting system.
    /// `type_name` should be used to group errors together.
    fn report_error(&self, type_name: String, message: String);
}

struct DefaultApplicationErrorReporter;
impl ApplicationErrorReporter for DefaultApplicationErrorReporter {
    fn report_error(&self, _type_name: String, _message: String) {}
}

lazy_static::lazy_static! {
    pub(crate) static ref APPLICATION_ERROR_REPORTER: RwLock<Box<dyn ApplicationErrorReporter>> =
        RwLock::new(Box::new(DefaultApplicationErrorReporter));
}

pub fn set_application_error_reporter(reporter: Box<dyn ApplicationErrorReporter>) {
    *APPLICATION_ERROR_REPORTER.write() = reporter;
}

pub fn unset_application_error_reporter() {
    *APPLICATION_ERROR_REPORTER.write() = Box::new(DefaultApplicationErrorReporter)
}

pub fn report_error_to_app(type_name: String, message: String) {
    APPLICATION_ERROR_REPORTER.read().report_error(type_name, message);
}
