//! This module is used for collection of runtime metrics of a `weft`
//! instance. The main item of interest is the [`Metrics`] trait. Users can
//! provide their own implementation of this, or use the default provided
//! implementation to disable gathering metrics.

/// The collection of all metrics exported by the stack. It is up to the
/// user to provide an implementation which implements the methods for
/// metrics they are interested in. All methods have a default
/// implementation, so if the user is not interested in any metrics, a NOOP
/// handler can be implemented as follows:
///
/// ```rust
/// use weft::metrics::Metrics;
///
/// #[derive(Clone)]
/// struct NoMetrics;
/// impl Metrics for NoMetrics {}
/// ```
pub trait Metrics {
    /// The partition network data was replaced with a different byte
    /// sequence.
    #[inline]
    fn netdata_updated(&self) {}

    /// The stable view of the partition network data changed.
    #[inline]
    fn netdata_stable_updated(&self) {}

    /// A malformed TLV was skipped while walking the network data.
    #[inline]
    fn netdata_tlv_skipped(&self) {}

    /// The DHCPv6 client transmitted a Solicit.
    #[inline]
    fn dhcp6_solicit_sent(&self) {}

    /// The DHCPv6 client accepted a Reply and installed an address.
    #[inline]
    fn dhcp6_reply_accepted(&self) {}

    /// The DHCPv6 client silently dropped an invalid Reply.
    #[inline]
    fn dhcp6_reply_dropped(&self) {}

    /// The indirect sender staged a frame for a sleepy child's data poll.
    #[inline]
    fn indirect_frame_prepared(&self) {}

    /// An indirect message finished delivery to a child. `success` is the
    /// cumulative delivery outcome over all of its fragments.
    #[inline]
    fn indirect_tx_done(&self, _success: bool) {}
}

/// A [`Metrics`] implementation which uses default implementations for all
/// metrics, effectively disabling them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
