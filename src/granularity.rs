//! Durability granularity and its resolution against the medium.

use std::fmt;

use crate::source::MediaKind;

/// Smallest unit at which a store becomes independently durable.
///
/// Variants are ordered from the strongest guarantee to the weakest, so
/// `Granularity::Byte < Granularity::Page`. A mapping that can offer a
/// *smaller* value than the caller asked for is always acceptable to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    /// True byte-addressable persistence: flush + fence reaches the power-fail domain.
    Byte,
    /// Cache lines must be flushed and fenced; the platform may still buffer them.
    CacheLine,
    /// Page-cache backed storage; durable only once the OS writes the page back.
    Page,
}

impl Granularity {
    /// Whether `self` gives a strictly stronger durability guarantee than `other`.
    #[must_use]
    pub fn is_stronger_than(self, other: Granularity) -> bool {
        self < other
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Byte => "byte",
            Granularity::CacheLine => "cache-line",
            Granularity::Page => "page",
        })
    }
}

/// Finest granularity a medium can deliver.
#[must_use]
pub fn media_capability(kind: MediaKind) -> Granularity {
    match kind {
        MediaKind::DeviceDax => Granularity::Byte,
        MediaKind::RegularFile | MediaKind::BlockDevice => Granularity::Page,
    }
}

/// Effective granularity of a mapping over `kind` when the caller accepts at most `requested_max`.
///
/// Device DAX can satisfy any request, so the request is returned unchanged.
/// Page-cache backed media can only offer page granularity; a finer request is
/// downgraded rather than rejected.
#[must_use]
pub fn resolve(kind: MediaKind, requested_max: Granularity) -> Granularity {
    let capability = media_capability(kind);
    let effective = requested_max.max(capability);
    if effective != requested_max {
        log::warn!(
            "{kind:?} cannot provide {requested_max} granularity, using {effective}"
        );
    }
    effective
}
