/// First four bytes of every snapshot, little-endian.
pub const SNAPSHOT_MAGIC: u32 = 0xC8C7_0FF0;
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl SectionId {
    /// Architectural register state (`CpuState`).
    pub const CPU: SectionId = SectionId(1);
    /// Pending external interrupts, interrupt shadow and NMI latch.
    pub const PENDING: SectionId = SectionId(2);
    /// Tick counter and scheduled timer deadlines.
    pub const TIME: SectionId = SectionId(3);
    /// Control registers as seen by the MMU plus the raw TLB arena.
    pub const MMU: SectionId = SectionId(4);
    pub const RAM: SectionId = SectionId(5);

    pub fn name(self) -> Option<&'static str> {
        match self {
            SectionId::CPU => Some("CPU"),
            SectionId::PENDING => Some("PENDING"),
            SectionId::TIME => Some("TIME"),
            SectionId::MMU => Some("MMU"),
            SectionId::RAM => Some("RAM"),
            _ => None,
        }
    }
}

impl core::fmt::Display for SectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.name() {
            write!(f, "{name}({})", self.0)
        } else {
            write!(f, "SectionId({})", self.0)
        }
    }
}
