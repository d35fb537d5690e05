use core::fmt;

#[cfg(feature = "std")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::cipher::{block_count, CipherEngine};
use crate::{Error, Flash, QspiAccess, ERASED_VALUE, PAGE_SIZE};

/// Number of bytes printed per line by `log_array()`.
const BYTES_PER_LINE: usize = 16;

/// Steps of the program/verify sequence, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Prepare,
    WriteEnable,
    Erase,
    EraseVerify,
    Encrypt,
    Program,
    ReadBack,
    Decrypt,
    Compare,
}

impl Step {
    /// Short name used for progress display.
    pub fn name(self) -> &'static str {
        match self {
            Step::Prepare => "Preparing",
            Step::WriteEnable => "Write enable",
            Step::Erase => "Erasing",
            Step::EraseVerify => "Verifying erase",
            Step::Encrypt => "Encrypting",
            Step::Program => "Writing",
            Step::ReadBack => "Reading back",
            Step::Decrypt => "Decrypting",
            Step::Compare => "Comparing",
        }
    }

    /// Message reported when this step fails.
    pub fn message(self) -> &'static str {
        match self {
            Step::Prepare => "Target address is not a whole page",
            Step::WriteEnable => "Write enable failed",
            Step::Erase => "Erasing memory failed",
            Step::EraseVerify => "Flash contains data other than 0xFF after erase",
            Step::Encrypt => "Encrypting data failed",
            Step::Program => "Writing to memory failed",
            Step::ReadBack => "Reading from memory failed",
            Step::Decrypt => "Decrypting data failed",
            Step::Compare => {
                "Read data does not match with written data. Read/Write operation failed."
            },
        }
    }
}

/// Number of step callbacks made by one complete run; write enable runs twice.
#[cfg(feature = "std")]
const SEQUENCE_STEPS: u64 = 9;

/// A fault signal, such as an error LED, asserted when the sequence fails.
pub trait FaultIndicator {
    fn assert_fault(&mut self);
}

/// Fault indicator with no hardware behind it, which only logs.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogFault;

impl FaultIndicator for LogFault {
    fn assert_fault(&mut self) {
        log::error!("Fault indicator asserted");
    }
}

/// The step at which a program/verify sequence stopped, and why.
#[derive(Debug)]
pub struct Failure {
    pub step: Step,
    pub error: Error,
}

impl Failure {
    /// Report the failure to the log with its error code, then assert `indicator`.
    ///
    /// The caller decides whether to halt.
    pub fn report<I: FaultIndicator + ?Sized>(&self, indicator: &mut I) {
        log::error!("================================================================================");
        log::error!("FAIL: {}", self.step.message());
        log::error!("Error Code: 0x{:08X}", self.error.code());
        log::error!("{:?}", self.error);
        log::error!("================================================================================");
        indicator.assert_fault();
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (error code 0x{:08X})", self.step.message(), self.error.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn at(step: Step) -> impl FnOnce(Error) -> Failure {
    move |error| Failure { step, error }
}

struct HexLine<'a>(&'a [u8]);

impl<'a> fmt::Display for HexLine<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "0x{:02X} ", byte)?;
        }
        Ok(())
    }
}

/// Dump `buf` to the log, 16 bytes per line.
pub fn log_array(message: &str, buf: &[u8]) {
    log::info!("{} ({} bytes):", message, buf.len());
    log::info!("-------------------------");
    for line in buf.chunks(BYTES_PER_LINE) {
        log::info!("{}", HexLine(line));
    }
}

/// Encrypted erase/program/verify of one page.
///
/// Erases the sector holding the page, checks it reads back erased, programs
/// the page with AES-encrypted data, reads it back, decrypts it, and compares
/// it against the original plaintext. Any failure ends the whole sequence.
///
/// Owns the flash transport, the cipher engine and every buffer used
/// during the sequence.
pub struct ProgramVerify<A: QspiAccess, C: CipherEngine> {
    flash: Flash<A>,
    cipher: C,
    address: u32,
    plaintext: [u8; PAGE_SIZE],
    ciphertext: [u8; PAGE_SIZE],
    readback: [u8; PAGE_SIZE],
    decrypted: [u8; PAGE_SIZE],
}

impl<A: QspiAccess, C: CipherEngine> ProgramVerify<A, C> {
    #[cfg(feature = "std")]
    const PROGRESS_TPL: &'static str = " {msg} [{bar:40}] {pos}/{len}";

    /// Prepare a sequence for the page at `address`.
    ///
    /// The plaintext defaults to the pattern `byte[i] = i`.
    pub fn new(flash: Flash<A>, cipher: C, address: u32) -> Self {
        let mut plaintext = [0u8; PAGE_SIZE];
        for (i, byte) in plaintext.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ProgramVerify {
            flash,
            cipher,
            address,
            plaintext,
            ciphertext: [0; PAGE_SIZE],
            readback: [0; PAGE_SIZE],
            decrypted: [0; PAGE_SIZE],
        }
    }

    /// Replace the plaintext to be programmed.
    pub fn with_plaintext(mut self, plaintext: [u8; PAGE_SIZE]) -> Self {
        self.plaintext = plaintext;
        self
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn plaintext(&self) -> &[u8; PAGE_SIZE] {
        &self.plaintext
    }

    /// Encrypted data as sent to the flash.
    pub fn ciphertext(&self) -> &[u8; PAGE_SIZE] {
        &self.ciphertext
    }

    /// Raw data as last read from the flash.
    pub fn readback(&self) -> &[u8; PAGE_SIZE] {
        &self.readback
    }

    /// Read-back data after decryption.
    pub fn decrypted(&self) -> &[u8; PAGE_SIZE] {
        &self.decrypted
    }

    pub fn flash(&self) -> &Flash<A> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut Flash<A> {
        &mut self.flash
    }

    /// Consume the sequence, returning the flash and cipher engine.
    pub fn release(self) -> (Flash<A>, C) {
        (self.flash, self.cipher)
    }

    /// Run the whole sequence, returning the failing step on error.
    pub fn run(&mut self) -> Result<(), Failure> {
        self.run_cb(|_| {})
    }

    /// Run the whole sequence, drawing a progress bar to the terminal.
    #[cfg(feature = "std")]
    pub fn run_progress(&mut self) -> Result<(), Failure> {
        let pb = ProgressBar::new(SEQUENCE_STEPS).with_style(ProgressStyle::default_bar()
            .template(Self::PROGRESS_TPL).progress_chars("=> "));
        let result = self.run_cb(|step| {
            pb.set_message(step.name());
            pb.inc(1);
        });
        match result {
            Ok(()) => pb.finish(),
            Err(_) => pb.abandon(),
        }
        result
    }

    /// Check the target is a whole page before anything touches the flash.
    fn check_target(&self) -> Result<(), Error> {
        let address = self.address;
        if address as usize % PAGE_SIZE != 0 {
            log::error!("Target 0x{:08X} is not aligned to a {} byte page", address, PAGE_SIZE);
            return Err(Error::InvalidAddress { address });
        }
        Ok(())
    }

    /// Run the whole sequence, calling `cb` as each step starts.
    ///
    /// The target address is checked first; a bad target fails at `Step::Prepare`
    /// without any command being sent.
    pub fn run_cb<F: FnMut(Step)>(&mut self, mut cb: F) -> Result<(), Failure> {
        let address = self.address;
        self.check_target().map_err(at(Step::Prepare))?;
        let erase_size = self.flash.erase_size();
        let sector = (address as usize - (address as usize % erase_size)) as u32;
        let blocks = block_count(PAGE_SIZE).map_err(at(Step::Encrypt))?;

        log::info!("1. Erasing sector at 0x{:08X}", sector);
        cb(Step::WriteEnable);
        self.flash.write_enable().map_err(at(Step::WriteEnable))?;
        cb(Step::Erase);
        self.flash.sector_erase(sector).map_err(at(Step::Erase))?;

        log::info!("2. Reading after erase and verifying that each byte is 0x{:02X}",
                   ERASED_VALUE);
        cb(Step::EraseVerify);
        self.flash.read(address, &mut self.readback).map_err(at(Step::EraseVerify))?;
        log_array("Received Data", &self.readback);
        if let Some(idx) = self.readback.iter().position(|&b| b != ERASED_VALUE) {
            let read = self.readback[idx];
            log::error!("Erased flash at 0x{:08X} reads 0x{:02X}", address + idx as u32, read);
            return Err(Failure {
                step: Step::EraseVerify,
                error: Error::EraseVerifyMismatch { address: address + idx as u32, read },
            });
        }

        log::info!("3. Writing data to memory");
        log_array("Write Data", &self.plaintext);
        cb(Step::Encrypt);
        self.cipher.encrypt_blocks(&self.plaintext, &mut self.ciphertext, blocks)
            .map_err(at(Step::Encrypt))?;
        log_array("Encrypted Data", &self.ciphertext);
        cb(Step::WriteEnable);
        self.flash.write_enable().map_err(at(Step::WriteEnable))?;
        cb(Step::Program);
        self.flash.page_program(address, &self.ciphertext).map_err(at(Step::Program))?;

        log::info!("4. Reading back for verification");
        cb(Step::ReadBack);
        self.readback = [0; PAGE_SIZE];
        self.flash.read(address, &mut self.readback).map_err(at(Step::ReadBack))?;
        cb(Step::Decrypt);
        self.cipher.decrypt_blocks(&self.readback, &mut self.decrypted, blocks)
            .map_err(at(Step::Decrypt))?;
        log_array("Received Data", &self.decrypted);

        cb(Step::Compare);
        let mismatch = self.plaintext.iter().zip(self.decrypted.iter())
            .enumerate().find(|(_, (a, b))| a != b);
        if let Some((idx, (&wrote, &read))) = mismatch {
            let addr = address + idx as u32;
            log::error!("Readback mismatch at 0x{:08X}: Wrote 0x{:02X}, read 0x{:02X}",
                        addr, wrote, read);
            return Err(Failure {
                step: Step::Compare,
                error: Error::ProgramReadbackMismatch { address: addr, wrote, read },
            });
        }

        log::info!("================================================================================");
        log::info!("SUCCESS: Read data matches with written data!");
        log::info!("================================================================================");
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::emulator::{EmulatedConfig, EmulatedFlash};
    use crate::{Command, SoftAes};

    fn sequence(emu: EmulatedFlash, address: u32) -> ProgramVerify<EmulatedFlash, SoftAes> {
        ProgramVerify::new(Flash::new(emu), SoftAes::new(), address)
    }

    fn encrypt_page(plain: &[u8]) -> [u8; PAGE_SIZE] {
        let mut out = [0u8; PAGE_SIZE];
        SoftAes::new().encrypt_blocks(plain, &mut out, 4).unwrap();
        out
    }

    #[test]
    fn test_end_to_end() {
        let mut pv = sequence(EmulatedFlash::new_default(), 0);
        pv.run().unwrap();

        let expected: Vec<u8> = (0..64).collect();
        assert_eq!(&pv.plaintext()[..], &expected[..]);
        assert_eq!(&pv.decrypted()[..], &expected[..]);
        assert_ne!(&pv.ciphertext()[..], &expected[..]);

        // The flash holds ciphertext, not plaintext.
        let (flash, _) = pv.release();
        assert_eq!(&flash.access().data()[..64], &encrypt_page(&expected)[..]);
    }

    #[test]
    fn test_command_order() {
        let mut pv = sequence(EmulatedFlash::new_default(), 0x40);
        pv.run().unwrap();
        let records = pv.flash().access().records();
        let commands: Vec<Command> = records.iter()
            .map(|r| r.command)
            .filter(|&c| c != Command::ReadStatus)
            .collect();
        assert_eq!(commands, vec![
            Command::WriteEnable,
            Command::SectorErase,
            Command::QuadIoRead,
            Command::WriteEnable,
            Command::QuadPageProgram,
            Command::QuadIoRead,
        ]);
        let erase = records.iter().find(|r| r.command == Command::SectorErase).unwrap();
        assert_eq!(erase.address, Some(0));
        // Every write operation is followed by status polling before the next command.
        let erase_idx = records.iter().position(|r| r.command == Command::SectorErase).unwrap();
        assert_eq!(records[erase_idx + 1].command, Command::ReadStatus);
    }

    #[test]
    fn test_other_plaintext_and_page() {
        let mut plain = [0u8; PAGE_SIZE];
        for (i, b) in plain.iter_mut().enumerate() {
            *b = 0xFF - (i as u8);
        }
        let mut pv = sequence(EmulatedFlash::new_default(), 0x4_0080).with_plaintext(plain);
        pv.run().unwrap();
        assert_eq!(pv.decrypted(), &plain);
        // The erase hit the second sector only.
        assert!(pv.flash().access().data()[..0x4_0000].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_verify_mismatch() {
        let mut emu = EmulatedFlash::with_data(EmulatedConfig::default(), &[0u8; 64]);
        emu.protect_sector(0);
        let mut pv = sequence(emu, 0);
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::EraseVerify);
        assert!(matches!(failure.error, Error::EraseVerifyMismatch { address: 0, read: 0 }));
        assert_eq!(failure.error.code(), 3);
        // Nothing was programmed after the failed check.
        let records = pv.flash().access().records();
        assert!(records.iter().all(|r| r.command != Command::QuadPageProgram));
    }

    #[test]
    fn test_readback_mismatch() {
        struct WrongKey(SoftAes, SoftAes);
        impl CipherEngine for WrongKey {
            fn encrypt_blocks(&mut self, i: &[u8], o: &mut [u8], n: usize) -> crate::Result<()> {
                self.0.encrypt_blocks(i, o, n)
            }
            fn decrypt_blocks(&mut self, i: &[u8], o: &mut [u8], n: usize) -> crate::Result<()> {
                self.1.decrypt_blocks(i, o, n)
            }
        }

        let cipher = WrongKey(SoftAes::new(), SoftAes::with_key([0u8; 16]));
        let mut pv = ProgramVerify::new(Flash::new(EmulatedFlash::new_default()), cipher, 0);
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::Compare);
        assert!(matches!(failure.error, Error::ProgramReadbackMismatch { .. }));
    }

    #[test]
    fn test_bus_failure_stops_sequence() {
        let mut emu = EmulatedFlash::new_default();
        emu.fail_on(Command::QuadPageProgram);
        let mut pv = sequence(emu, 0);
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::Program);
        assert_eq!(failure.error.code(), 1);
        let last = pv.flash().access().records().last().unwrap();
        assert_eq!(last.command, Command::QuadPageProgram);
    }

    #[test]
    fn test_busy_timeout() {
        let mut emu = EmulatedFlash::new_default();
        emu.set_busy_polls(100);
        let mut pv = sequence(emu, 0);
        pv.flash_mut().set_max_busy_polls(Some(10));
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::Erase);
        assert!(matches!(failure.error, Error::DeviceBusyTimeout { polls: 10 }));
    }

    #[test]
    fn test_unbounded_polling_waits_for_ready() {
        let mut emu = EmulatedFlash::new_default();
        emu.set_busy_polls(5000);
        let mut pv = sequence(emu, 0);
        pv.flash_mut().set_max_busy_polls(None);
        pv.run().unwrap();
    }

    #[test]
    fn test_steps_reported_in_order() {
        let mut pv = sequence(EmulatedFlash::new_default(), 0);
        let mut steps = Vec::new();
        pv.run_cb(|s| steps.push(s)).unwrap();
        assert_eq!(steps.len() as u64, SEQUENCE_STEPS);
        assert_eq!(steps, vec![
            Step::WriteEnable, Step::Erase, Step::EraseVerify, Step::Encrypt,
            Step::WriteEnable, Step::Program, Step::ReadBack, Step::Decrypt, Step::Compare,
        ]);
    }

    #[test]
    fn test_misaligned_target_sends_nothing() {
        let emu = EmulatedFlash::with_data(EmulatedConfig::default(), &[0u8; 256]);
        let mut pv = sequence(emu, 0x20);
        let mut steps = Vec::new();
        let failure = pv.run_cb(|s| steps.push(s)).unwrap_err();
        assert_eq!(failure.step, Step::Prepare);
        assert!(matches!(failure.error, Error::InvalidAddress { address: 0x20 }));
        assert!(steps.is_empty());
        // The sector holding neighbouring data was never erased.
        let emu = pv.flash().access();
        assert!(emu.records().is_empty());
        assert!(emu.data()[..256].iter().all(|&b| b == 0x00));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_erase_size_above_u32() {
        let mut pv = sequence(EmulatedFlash::new_default(), 0);
        pv.flash_mut().set_erase_size(1 << 32);
        pv.run().unwrap();
        let records = pv.flash().access().records();
        let erase = records.iter().find(|r| r.command == Command::SectorErase).unwrap();
        assert_eq!(erase.address, Some(0));
    }

    struct FailingCipher {
        fail_encrypt: bool,
    }

    impl CipherEngine for FailingCipher {
        fn encrypt_blocks(&mut self, i: &[u8], o: &mut [u8], n: usize) -> crate::Result<()> {
            if self.fail_encrypt {
                return Err(Error::CipherEngine);
            }
            SoftAes::new().encrypt_blocks(i, o, n)
        }
        fn decrypt_blocks(&mut self, _: &[u8], _: &mut [u8], _: usize) -> crate::Result<()> {
            Err(Error::CipherEngine)
        }
    }

    #[test]
    fn test_encrypt_failure_stops_before_program() {
        let cipher = FailingCipher { fail_encrypt: true };
        let mut pv = ProgramVerify::new(Flash::new(EmulatedFlash::new_default()), cipher, 0);
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::Encrypt);
        assert_eq!(failure.error.code(), 5);
        let records = pv.flash().access().records();
        assert!(records.iter().all(|r| r.command != Command::QuadPageProgram));
        // Only the erase took write enable.
        let wren = records.iter().filter(|r| r.command == Command::WriteEnable).count();
        assert_eq!(wren, 1);
    }

    #[test]
    fn test_decrypt_failure() {
        let cipher = FailingCipher { fail_encrypt: false };
        let mut pv = ProgramVerify::new(Flash::new(EmulatedFlash::new_default()), cipher, 0);
        let failure = pv.run().unwrap_err();
        assert_eq!(failure.step, Step::Decrypt);
        assert_eq!(failure.error.code(), 5);
        assert_eq!(failure.to_string(), "Decrypting data failed (error code 0x00000005)");
        // The page was programmed and read back before decryption failed.
        let records = pv.flash().access().records();
        let reads = records.iter().filter(|r| r.command == Command::QuadIoRead).count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn test_run_progress() {
        let mut pv = sequence(EmulatedFlash::new_default(), 0x40);
        pv.run_progress().unwrap();
        let expected: Vec<u8> = (0..64).collect();
        assert_eq!(&pv.decrypted()[..], &expected[..]);

        let mut emu = EmulatedFlash::new_default();
        emu.fail_on(Command::SectorErase);
        let mut pv = sequence(emu, 0);
        assert_eq!(pv.run_progress().unwrap_err().step, Step::Erase);
    }

    #[test]
    fn test_failure_report_asserts_fault() {
        struct Led(bool);
        impl FaultIndicator for Led {
            fn assert_fault(&mut self) {
                self.0 = true;
            }
        }
        let failure = Failure { step: Step::Program, error: Error::CipherEngine };
        let mut led = Led(false);
        failure.report(&mut led);
        assert!(led.0);
        assert_eq!(failure.to_string(), "Writing to memory failed (error code 0x00000005)");
    }
}
