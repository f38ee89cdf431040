use mailparse::{MailAddr, MailAddrList};
use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressList};

/// The `MAIL FROM`/`RCPT TO` pair, distinct from message headers.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Option<AddressList>,
}

impl Envelope {
    /// Returns a reference to the sender for this message
    #[inline]
    #[must_use]
    pub fn sender(&self) -> Option<&MailAddr> {
        self.sender.as_deref()
    }

    /// Sets the sender for this message, or clears it for the null sender `<>`.
    pub fn set_sender(&mut self, sender: Option<Address>) {
        self.sender = sender;
    }

    /// Returns a mutable reference to the sender for this message
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    /// Returns a reference to the recipients for this message
    #[inline]
    #[must_use]
    pub const fn recipients(&self) -> Option<&AddressList> {
        self.recipients.as_ref()
    }

    /// Returns a mutable reference to the recipients for this message
    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut Option<AddressList> {
        &mut self.recipients
    }

    /// Appends a recipient, initialising the list if this is the first one.
    pub fn add_recipient(&mut self, recipient: Address) {
        self.recipients
            .get_or_insert_with(|| AddressList(Vec::new()))
            .push(recipient);
    }

    /// Number of recipients currently on the envelope.
    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.recipients.as_ref().map_or(0, |r| r.len())
    }

    /// Resets the envelope to its empty state (used on RSET, STARTTLS, and
    /// after a message has been enqueued).
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients = None;
    }
}
