use std::collections::BTreeSet;
use std::fmt;

use aup_applier::Outcome;
use aup_types::Oid;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Who an index entry or event concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Must be live in the target directory.
    Target,
    /// Must be prefetched into local storage.
    Buffer,
}

impl Audience {
    pub const BOTH: [Audience; 2] = [Audience::Target, Audience::Buffer];
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Target => "target",
            Self::Buffer => "buffer",
        })
    }
}

/// Discriminant of [`InstanceEvent`], used for filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewReleaseFound,
    MostReleases,
    CatalogIncomplete,
    CatalogComplete,
    StorageIncomplete,
    StorageComplete,
    TotallyComplete,
    TargetUpdated,
}

/// State transitions published by an [`Instance`](crate::Instance).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceEvent {
    /// A release entered the catalog.
    NewReleaseFound(Oid),
    /// The most recent release set of an audience changed.
    MostReleases {
        audience: Audience,
        releases: BTreeSet<Oid>,
    },
    /// A wanted catalog object is absent.
    CatalogIncomplete { audience: Audience, oid: Oid },
    /// A wanted catalog object became present.
    CatalogComplete { audience: Audience, oid: Oid },
    /// A wanted blob is absent.
    StorageIncomplete { audience: Audience, oid: Oid },
    /// A wanted blob became present.
    StorageComplete { audience: Audience, oid: Oid },
    /// Everything the audience wants is present.
    TotallyComplete { audience: Audience },
    /// The applier ran against the target directory.
    TargetUpdated(Outcome),
}

impl InstanceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewReleaseFound(_) => EventKind::NewReleaseFound,
            Self::MostReleases { .. } => EventKind::MostReleases,
            Self::CatalogIncomplete { .. } => EventKind::CatalogIncomplete,
            Self::CatalogComplete { .. } => EventKind::CatalogComplete,
            Self::StorageIncomplete { .. } => EventKind::StorageIncomplete,
            Self::StorageComplete { .. } => EventKind::StorageComplete,
            Self::TotallyComplete { .. } => EventKind::TotallyComplete,
            Self::TargetUpdated(_) => EventKind::TargetUpdated,
        }
    }

    /// The audience concerned, for audience-scoped events.
    pub fn audience(&self) -> Option<Audience> {
        match self {
            Self::MostReleases { audience, .. }
            | Self::CatalogIncomplete { audience, .. }
            | Self::CatalogComplete { audience, .. }
            | Self::StorageIncomplete { audience, .. }
            | Self::StorageComplete { audience, .. }
            | Self::TotallyComplete { audience } => Some(*audience),
            Self::NewReleaseFound(_) | Self::TargetUpdated(_) => None,
        }
    }
}

/// Filter for subscribing to a subset of instance events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// If set, audience-scoped events are delivered only for these.
    pub audiences: Option<Vec<Audience>>,
    /// If set, only events of these kinds are delivered.
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            audiences: None,
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn matches(&self, event: &InstanceEvent) -> bool {
        if let (Some(audiences), Some(audience)) = (&self.audiences, event.audience()) {
            if !audiences.contains(&audience) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        true
    }
}

/// A broadcast channel receiver for instance events.
pub type EventStream = broadcast::Receiver<InstanceEvent>;

struct Subscriber {
    filter: EventFilter,
    sender: broadcast::Sender<InstanceEvent>,
}

/// Fan-out of events to filtered subscribers.
pub(crate) struct Notifier {
    subscribers: Vec<Subscriber>,
    capacity: usize,
}

impl Notifier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Channel capacity for subscriptions made from now on.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub(crate) fn subscribe(&mut self, filter: EventFilter) -> EventStream {
        let (sender, rx) = broadcast::channel(self.capacity);
        self.subscribers.push(Subscriber { filter, sender });
        rx
    }

    /// Deliver to matching subscribers. Subscribers whose receivers are all
    /// dropped are pruned.
    pub(crate) fn emit(&mut self, event: InstanceEvent) {
        trace!(?event, "instance event");
        self.subscribers.retain(|sub| {
            if sub.filter.matches(&event) {
                sub.sender.send(event.clone()).is_ok()
            } else {
                sub.sender.receiver_count() > 0
            }
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
