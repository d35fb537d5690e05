/// Status Register 1
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Get WIP (write in progress) bit.
    pub fn get_busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }
}

#[test]
fn test_status_bits() {
    assert!(StatusRegister(0x01).get_busy());
    assert!(!StatusRegister(0x02).get_busy());
    assert!(StatusRegister(0x02).get_wel());
    assert!(!StatusRegister(0x00).get_wel());
}
