//! Per-broker mailboxes.
//!
//! Every broker owns the receiving end of an unbounded crossbeam channel. All
//! sending ends live in a shared [`PostOffice`], so any broker can address any
//! other broker by id: many producers, a single consumer per mailbox. Neither
//! sending nor polling ever blocks.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;

use crate::bg_error::ProtocolError;
use crate::bg_interface::{BrokerId, BrokerMessage};

/// Routing table from broker id to that broker's inbox.
pub struct PostOffice {
    inboxes: HashMap<BrokerId, Sender<BrokerMessage>>,
}

impl PostOffice {
    /// Open one mailbox per id. Returns the shared post office together with the
    /// mailboxes, in the order of `ids`.
    pub fn open<I>(ids: I) -> (Arc<PostOffice>, Vec<Mailbox>)
    where
        I: IntoIterator<Item = BrokerId>,
    {
        let mut inboxes = HashMap::new();
        let mut receivers = Vec::new();

        for id in ids {
            let (tx, rx) = unbounded();
            inboxes.insert(id.clone(), tx);
            receivers.push((id, rx));
        }

        let post_office = Arc::new(PostOffice { inboxes });
        let mailboxes = receivers
            .into_iter()
            .map(|(owner, inbox)| Mailbox {
                owner,
                inbox,
                post_office: Arc::clone(&post_office),
            })
            .collect();

        (post_office, mailboxes)
    }

    pub fn deliver(&self, from: &BrokerId, to: &BrokerId, message: BrokerMessage) -> Result<(), ProtocolError> {
        let no_mailbox = || ProtocolError::NoMailbox {
            broker: from.clone(),
            target: to.clone(),
        };

        self.inboxes
            .get(to)
            .ok_or_else(no_mailbox)?
            .send(message)
            .map_err(|_| no_mailbox())
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}

/// A broker's own inbox plus a handle for sending to everybody else.
pub struct Mailbox {
    owner: BrokerId,
    inbox: Receiver<BrokerMessage>,
    post_office: Arc<PostOffice>,
}

impl Mailbox {
    pub fn owner(&self) -> &BrokerId {
        &self.owner
    }

    /// Next message, or `None` if the inbox is currently empty.
    pub fn poll(&self) -> Option<BrokerMessage> {
        self.inbox.try_recv().ok()
    }

    pub fn send(&self, to: &BrokerId, message: BrokerMessage) -> Result<(), ProtocolError> {
        self.post_office.deliver(&self.owner, to, message)
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}
