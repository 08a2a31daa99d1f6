//! Packet size accounting.  Each layer that touches an outgoing packet
//! contributes header and footer bytes and may constrain the total size;
//! the engine folds the contributions together whenever a socket's link
//! changes.

/// Header/footer reservations and size limits for one layer, or the folded
/// result across several layers.  A zero `max_packet_size` means
/// unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSizeInformation {
    /// Bytes of header the layer needs in front of the payload.
    pub header_size: usize,
    /// Bytes of footer the layer needs behind the payload.
    pub footer_size: usize,
    /// Largest total packet the layer can carry, zero if unconstrained.
    pub max_packet_size: usize,
    /// Smallest total packet the layer will emit.
    pub min_packet_size: usize,
}

impl PacketSizeInformation {
    /// Folds a lower layer's contribution into this one: header and footer
    /// reservations add, the maximum tightens, the minimum loosens.
    pub fn layer_on(&mut self, lower: &PacketSizeInformation) {
        self.header_size += lower.header_size;
        self.footer_size += lower.footer_size;
        if lower.max_packet_size != 0
            && (self.max_packet_size == 0 || lower.max_packet_size < self.max_packet_size)
        {
            self.max_packet_size = lower.max_packet_size;
        }
        if lower.min_packet_size > self.min_packet_size {
            self.min_packet_size = lower.min_packet_size;
        }
    }
}
