use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha1::{Digest, Sha1};

use super::mapper::Mirroring;

pub const PRG_WINDOW_START: u16 = 0x8000;
pub const PRG_BANK_UNIT: usize = 0x2000;
pub const CHR_BANK_UNIT: usize = 0x0400;
pub const DEFAULT_PRG_RAM_SIZE: usize = 8 * 1024;
const CHR_RAM_SIZE: usize = 8 * 1024;

/// Entry points of a standalone sound program, taken from its header by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundProgram {
    pub init_addr: u16,
    pub play_addr: u16,
    pub track_count: u8,
}

/// Already-parsed program image handed to the core at load time.
///
/// Header parsing lives outside the crate; callers fill this from whatever
/// container format they read and the constructors reject images the mappers
/// cannot address.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub mapper_id: u16,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
    pub load_addr: u16,
    pub sound: Option<SoundProgram>,
}

impl ProgramImage {
    pub fn cartridge(mapper_id: u16, prg_rom: Vec<u8>, chr_rom: Vec<u8>) -> Result<Self> {
        if prg_rom.is_empty() {
            bail!("invalid PRG ROM: empty payload");
        }
        if prg_rom.len() % PRG_BANK_UNIT != 0 {
            bail!(
                "PRG ROM size {} is not a multiple of {} bytes",
                prg_rom.len(),
                PRG_BANK_UNIT
            );
        }
        if chr_rom.len() % CHR_BANK_UNIT != 0 {
            bail!(
                "CHR ROM size {} is not a multiple of {} bytes",
                chr_rom.len(),
                CHR_BANK_UNIT
            );
        }

        let (chr_data, chr_is_ram) = if chr_rom.is_empty() {
            (vec![0; CHR_RAM_SIZE], true)
        } else {
            (chr_rom, false)
        };

        Ok(Self {
            mapper_id,
            mirroring: Mirroring::Horizontal,
            four_screen: false,
            has_battery_backed_ram: false,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size: DEFAULT_PRG_RAM_SIZE,
            load_addr: PRG_WINDOW_START,
            sound: None,
        })
    }

    pub fn sound_program(
        data: Vec<u8>,
        load_addr: u16,
        init_addr: u16,
        play_addr: u16,
        track_count: u8,
    ) -> Result<Self> {
        if data.is_empty() {
            bail!("invalid sound program: empty payload");
        }
        if load_addr < PRG_WINDOW_START {
            bail!(
                "sound program load address ${load_addr:04X} is below the ROM window at ${PRG_WINDOW_START:04X}"
            );
        }
        let end = load_addr as usize + data.len();
        if end > 0x1_0000 {
            bail!(
                "sound program truncated: {} bytes at ${load_addr:04X} overrun the address space",
                data.len()
            );
        }
        for (name, addr) in [("init", init_addr), ("play", play_addr)] {
            if !(load_addr as usize..end).contains(&(addr as usize)) {
                bail!("{name} address ${addr:04X} lies outside the loaded program");
            }
        }
        if track_count == 0 {
            bail!("sound program declares zero tracks");
        }

        Ok(Self {
            mapper_id: 0,
            mirroring: Mirroring::Horizontal,
            four_screen: false,
            has_battery_backed_ram: false,
            prg_rom: data,
            chr_data: vec![0; CHR_RAM_SIZE],
            chr_is_ram: true,
            prg_ram_size: DEFAULT_PRG_RAM_SIZE,
            load_addr,
            sound: Some(SoundProgram {
                init_addr,
                play_addr,
                track_count,
            }),
        })
    }

    pub fn with_mirroring(mut self, mirroring: Mirroring) -> Self {
        self.four_screen = mirroring == Mirroring::FourScreen;
        self.mirroring = mirroring;
        self
    }

    pub fn with_battery(mut self, has_battery_backed_ram: bool) -> Self {
        self.has_battery_backed_ram = has_battery_backed_ram;
        self
    }

    pub fn with_prg_ram_size(mut self, size: usize) -> Self {
        self.prg_ram_size = size.max(DEFAULT_PRG_RAM_SIZE);
        self
    }

    /// SHA-1 of the PRG image, base64 encoded. Identifies the image a snapshot belongs to.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.prg_rom)
    }
}

pub(crate) fn fingerprint(prg_rom: &[u8]) -> String {
    let digest = Sha1::digest(prg_rom);
    BASE64_STANDARD.encode(digest)
}
