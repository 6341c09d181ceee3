//! Reserved destination ids and the DMR id range partitioning.

/// Echo loopback service id.
pub const PARROT_USER: u32 = 9990;

/// Transmitting here clears the dynamic talkgroup on the packet's slot.
pub const TALKGROUP_UNLINK: u32 = 4000;

/// Classification of a private-call destination by id range. The ranges
/// are inclusive and disjoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Repeater,
    User,
    Hotspot,
    Other,
}

pub fn classify(id: u32) -> Destination {
    match id {
        100_000..=999_999 => Destination::Repeater,
        1_000_000..=9_999_999 => Destination::User,
        100_000_000..=999_999_999 => Destination::Hotspot,
        _ => Destination::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_boundaries() {
        assert_eq!(classify(99_999), Destination::Other);
        assert_eq!(classify(100_000), Destination::Repeater);
        assert_eq!(classify(999_999), Destination::Repeater);
        assert_eq!(classify(1_000_000), Destination::User);
        assert_eq!(classify(9_999_999), Destination::User);
        assert_eq!(classify(10_000_000), Destination::Other);
        assert_eq!(classify(100_000_000), Destination::Hotspot);
        assert_eq!(classify(999_999_999), Destination::Hotspot);
        assert_eq!(classify(1_000_000_000), Destination::Other);
    }
}
