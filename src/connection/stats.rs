use std::fmt;

/// Connection traffic counters.
#[derive(Default, Debug, Copy, Clone)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub sent_overhead: u64,
    pub recv_overhead: u64,
    pub resent_chunks: u64,
    pub dropped_chunks: u64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\t{} bytes sent   in {} packets ({:.3} bytes/packet)",
            self.bytes_sent,
            self.packets_sent,
            ratio(self.bytes_sent, self.packets_sent)
        )?;
        writeln!(
            f,
            "\t{} bytes recv'd in {} packets ({:.3} bytes/packet)",
            self.bytes_recv,
            self.packets_recv,
            ratio(self.bytes_recv, self.packets_recv)
        )?;
        writeln!(
            f,
            "\t{{{:.3}x, {:.3}x}} relative protocol overhead {{up, down}}",
            ratio(self.sent_overhead, self.bytes_sent),
            ratio(self.recv_overhead, self.bytes_recv)
        )?;
        write!(
            f,
            "\t{} incoming chunks dropped, {} outgoing chunks resent",
            self.dropped_chunks, self.resent_chunks
        )
    }
}
