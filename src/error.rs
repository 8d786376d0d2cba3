// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered at the boundaries of the message-exchange layer.
///
/// Exchange-level failures (timeouts, resets, exhausted id spaces) are *not*
/// reported through this type: they reach the originator exclusively through
/// its [`ResponseHandler`][crate::ResponseHandler]. `Error` is the currency of
/// the transport boundary and internal plumbing only.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// Operation timed out waiting for a response.
    ResponseTimeout,

    /// An I/O error occurred while performing this operation.
    IOError,

    /// This operation has been cancelled.
    Cancelled,

    /// The transaction was reset.
    Reset,

    /// An unspecified error has occurred.
    Unspecified,
}

impl std::convert::From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IOError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl Default for Error {
    fn default() -> Self {
        Error::Unspecified
    }
}
