// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Temporary reply destinations.

use std::time::Duration;

use super::envelope::Address;
use super::session::{Inbox, Session};
use crate::error::FetchError;

/// A private, uniquely named destination for the reply to one request.
///
/// The subscription is released when the destination is dropped, on every
/// exit path of the request.
#[derive(Debug)]
pub struct ReplyDestination {
    address: Address,
    inbox: Inbox,
    session: Session,
}

impl ReplyDestination {
    pub(crate) fn new(address: Address, inbox: Inbox, session: Session) -> Self {
        Self {
            address,
            inbox,
            session,
        }
    }

    /// Returns the address replies must be sent to.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Waits up to `timeout` for the reply payload.
    ///
    /// # Errors
    ///
    /// See [`Inbox::fetch`].
    pub async fn fetch(&mut self, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.inbox.fetch(timeout).await
    }
}

impl Drop for ReplyDestination {
    fn drop(&mut self) {
        tracing::trace!(address = %self.address, "Releasing reply destination");
        self.session.release(self.address.as_str());
    }
}
