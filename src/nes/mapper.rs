use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::cartridge::{DEFAULT_PRG_RAM_SIZE, PRG_WINDOW_START, ProgramImage};
use super::snapshot::bytes_b64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

/// Cartridge bank-switching hardware as seen from the CPU and the pattern-table bus.
///
/// `cpu_write` is the only mutator of bank state. Every ROM read resolves through
/// `prg_rom_offset`, so the patcher and the read path agree on the layout.
pub trait Mapper: Send {
    fn cpu_read(&mut self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8);
    fn ppu_read(&mut self, addr: u16) -> u8;
    fn ppu_write(&mut self, addr: u16, value: u8);
    fn mirroring(&self) -> Mirroring;

    /// Raw PRG ROM offset currently visible at a CPU address.
    fn prg_rom_offset(&self, addr: u16) -> Option<usize>;
    /// PRG bank index in units of `prg_bank_size` for a CPU address.
    fn prg_bank_for(&self, addr: u16) -> Option<usize> {
        self.prg_rom_offset(addr)
            .map(|offset| offset / self.prg_bank_size())
    }
    fn prg_bank_size(&self) -> usize;
    /// CHR bank index in units of `chr_bank_size` for a pattern-table address.
    fn chr_bank_for(&self, addr: u16) -> usize;
    fn chr_bank_size(&self) -> usize;

    fn prg_rom(&self) -> &[u8];
    fn prg_rom_mut(&mut self) -> &mut [u8];
    /// Work RAM behind `$6000-$7FFF`, ignoring any enable or protect bits.
    fn prg_ram(&self) -> &[u8];
    fn prg_ram_mut(&mut self) -> &mut [u8];

    fn save_state(&self) -> MapperState;
    fn load_state(&mut self, state: &MapperState) -> Result<()>;

    fn tick_cpu_cycle(&mut self) {}
    /// Scanline event for hosts that do not feed pattern fetches through `notify_ppu_read_addr`.
    fn clock_scanline(&mut self) {}
    fn notify_ppu_read_addr(&mut self, _addr: u16) {}
    fn irq_pending(&self) -> bool {
        false
    }
    fn debug_state(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum MapperRegisters {
    Fixed,
    Discrete(DiscreteRegs),
    ShiftRegister(ShiftRegisterRegs),
    MultiBankIrq(MultiBankIrqRegs),
    LatchChr(LatchChrRegs),
    SingleRegister(SingleRegisterRegs),
    CounterIrq(CounterIrqRegs),
}

impl MapperRegisters {
    fn kind(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Discrete(_) => "discrete",
            Self::ShiftRegister(_) => "shift_register",
            Self::MultiBankIrq(_) => "multi_bank_irq",
            Self::LatchChr(_) => "latch_chr",
            Self::SingleRegister(_) => "single_register",
            Self::CounterIrq(_) => "counter_irq",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperState {
    pub registers: MapperRegisters,
    #[serde(with = "bytes_b64")]
    pub prg_ram: Vec<u8>,
    #[serde(with = "bytes_b64")]
    pub chr_ram: Vec<u8>,
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        7 => "AxROM",
        9 => "MMC2",
        10 => "MMC4",
        11 => "Color Dreams",
        17 => "FFE F8xxx",
        66 => "GxROM",
        _ => "Unsupported (fixed fallback)",
    }
}

pub fn is_supported(mapper_id: u16) -> bool {
    matches!(mapper_id, 0 | 1 | 2 | 3 | 4 | 7 | 9 | 10 | 11 | 17 | 66)
}

pub fn create_mapper(image: ProgramImage) -> Result<Box<dyn Mapper>> {
    if image.prg_rom.is_empty() {
        bail!("cannot map an empty PRG image");
    }
    let mapper: Box<dyn Mapper> = match image.mapper_id {
        1 => Box::new(ShiftRegisterMapper::new(image)),
        2 => Box::new(DiscreteMapper::new(image, DiscreteBoard::UxRom)),
        3 => Box::new(DiscreteMapper::new(image, DiscreteBoard::CnRom)),
        4 => Box::new(MultiBankIrqMapper::new(image)),
        7 => Box::new(SingleRegisterMapper::new(image, SingleRegisterBoard::AxRom)),
        9 => Box::new(LatchChrMapper::new(image, LatchBoard::Mmc2)),
        10 => Box::new(LatchChrMapper::new(image, LatchBoard::Mmc4)),
        11 => Box::new(SingleRegisterMapper::new(
            image,
            SingleRegisterBoard::ColorDreams,
        )),
        17 => Box::new(CounterIrqMapper::new(image)),
        66 => Box::new(SingleRegisterMapper::new(image, SingleRegisterBoard::GxRom)),
        _ => Box::new(FixedMapper::new(image)),
    };
    Ok(mapper)
}

/// Owned PRG/CHR/work-RAM arenas shared by every board. All indexing wraps by size.
struct CartMemory {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
}

impl CartMemory {
    fn new(image: ProgramImage) -> Self {
        let chr = if image.chr_data.is_empty() {
            vec![0; 0x2000]
        } else {
            image.chr_data
        };
        Self {
            prg_rom: image.prg_rom,
            chr,
            chr_is_ram: image.chr_is_ram,
            prg_ram: vec![0; image.prg_ram_size.max(DEFAULT_PRG_RAM_SIZE)],
        }
    }

    fn prg_bank_count(&self, bank_size: usize) -> usize {
        (self.prg_rom.len() / bank_size).max(1)
    }

    fn chr_bank_count(&self, bank_size: usize) -> usize {
        (self.chr.len() / bank_size).max(1)
    }

    fn last_prg_bank(&self, bank_size: usize) -> usize {
        self.prg_bank_count(bank_size) - 1
    }

    fn prg_offset(&self, bank: usize, bank_size: usize, addr: u16) -> Option<usize> {
        if addr < PRG_WINDOW_START {
            return None;
        }
        let bank = bank % self.prg_bank_count(bank_size);
        Some((bank * bank_size + (addr as usize & (bank_size - 1))) % self.prg_rom.len())
    }

    fn chr_offset(&self, bank: usize, bank_size: usize, addr: u16) -> usize {
        let bank = bank % self.chr_bank_count(bank_size);
        (bank * bank_size + (addr as usize & (bank_size - 1))) % self.chr.len()
    }

    fn read_prg(&self, offset: Option<usize>) -> u8 {
        offset
            .and_then(|idx| self.prg_rom.get(idx))
            .copied()
            .unwrap_or(0)
    }

    fn read_prg_ram(&self, addr: u16) -> u8 {
        self.prg_ram[(addr as usize - 0x6000) % self.prg_ram.len()]
    }

    fn write_prg_ram(&mut self, addr: u16, value: u8) {
        let idx = (addr as usize - 0x6000) % self.prg_ram.len();
        self.prg_ram[idx] = value;
    }

    fn write_chr(&mut self, idx: usize, value: u8) {
        if self.chr_is_ram {
            self.chr[idx] = value;
        }
    }

    fn save(&self, registers: MapperRegisters) -> MapperState {
        MapperState {
            registers,
            prg_ram: self.prg_ram.clone(),
            chr_ram: if self.chr_is_ram {
                self.chr.clone()
            } else {
                Vec::new()
            },
        }
    }

    fn restore_arenas(&mut self, state: &MapperState) -> Result<()> {
        if state.prg_ram.len() != self.prg_ram.len() {
            bail!(
                "snapshot work RAM is {} bytes, cartridge has {}",
                state.prg_ram.len(),
                self.prg_ram.len()
            );
        }
        if self.chr_is_ram && state.chr_ram.len() != self.chr.len() {
            bail!(
                "snapshot CHR RAM is {} bytes, cartridge has {}",
                state.chr_ram.len(),
                self.chr.len()
            );
        }
        self.prg_ram.copy_from_slice(&state.prg_ram);
        if self.chr_is_ram {
            self.chr.copy_from_slice(&state.chr_ram);
        }
        Ok(())
    }
}

fn wrong_variant(expected: &str, found: &MapperRegisters) -> anyhow::Error {
    anyhow::anyhow!(
        "snapshot holds {} mapper registers, loaded mapper is {expected}",
        found.kind()
    )
}

/// NROM, the fallback for unrecognized IDs, and non-banked sound programs.
struct FixedMapper {
    memory: CartMemory,
    mirroring: Mirroring,
    load_addr: u16,
    sound_program: bool,
    mapper_id: u16,
}

impl FixedMapper {
    fn new(image: ProgramImage) -> Self {
        Self {
            mirroring: image.mirroring,
            load_addr: image.load_addr,
            sound_program: image.sound.is_some(),
            mapper_id: image.mapper_id,
            memory: CartMemory::new(image),
        }
    }
}

impl Mapper for FixedMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.memory.read_prg_ram(addr),
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if (0x6000..=0x7FFF).contains(&addr) {
            self.memory.write_prg_ram(addr, value);
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        self.memory.chr[addr as usize % self.memory.chr.len()]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let idx = addr as usize % self.memory.chr.len();
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        if addr < PRG_WINDOW_START {
            return None;
        }
        let len = self.memory.prg_rom.len();
        if self.sound_program {
            let offset = addr.checked_sub(self.load_addr)? as usize;
            return (offset < len).then_some(offset);
        }
        if len > 0x8000 {
            // Oversized image on an unknown board: first 16K low, last 16K high.
            let bank = if addr < 0xC000 {
                0
            } else {
                self.memory.last_prg_bank(0x4000)
            };
            return self.memory.prg_offset(bank, 0x4000, addr);
        }
        Some((addr - PRG_WINDOW_START) as usize % len)
    }

    fn prg_bank_size(&self) -> usize {
        0x4000
    }

    fn chr_bank_for(&self, _addr: u16) -> usize {
        0
    }

    fn chr_bank_size(&self) -> usize {
        0x2000
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::Fixed)
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        if state.registers != MapperRegisters::Fixed {
            return Err(wrong_variant("fixed", &state.registers));
        }
        self.memory.restore_arenas(state)
    }

    fn debug_state(&self) -> String {
        format!(
            "fixed mapper={} load=${:04X} prg_len={} sound={}",
            self.mapper_id,
            self.load_addr,
            self.memory.prg_rom.len(),
            self.sound_program
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscreteBoard {
    UxRom,
    CnRom,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteRegs {
    pub bank_select: u8,
}

struct DiscreteMapper {
    memory: CartMemory,
    board: DiscreteBoard,
    mirroring: Mirroring,
    regs: DiscreteRegs,
}

impl DiscreteMapper {
    fn new(image: ProgramImage, board: DiscreteBoard) -> Self {
        Self {
            mirroring: image.mirroring,
            memory: CartMemory::new(image),
            board,
            regs: DiscreteRegs::default(),
        }
    }
}

impl Mapper for DiscreteMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.memory.read_prg_ram(addr),
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => self.memory.write_prg_ram(addr, value),
            0x8000..=0xFFFF => self.regs.bank_select = value,
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x2000, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x2000, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        match self.board {
            DiscreteBoard::UxRom => {
                let bank = if addr < 0xC000 {
                    self.regs.bank_select as usize
                } else {
                    self.memory.last_prg_bank(0x4000)
                };
                self.memory.prg_offset(bank, 0x4000, addr)
            }
            DiscreteBoard::CnRom => self.memory.prg_offset(0, 0x8000, addr),
        }
    }

    fn prg_bank_size(&self) -> usize {
        match self.board {
            DiscreteBoard::UxRom => 0x4000,
            DiscreteBoard::CnRom => 0x8000,
        }
    }

    fn chr_bank_for(&self, _addr: u16) -> usize {
        match self.board {
            DiscreteBoard::UxRom => 0,
            DiscreteBoard::CnRom => {
                self.regs.bank_select as usize % self.memory.chr_bank_count(0x2000)
            }
        }
    }

    fn chr_bank_size(&self) -> usize {
        0x2000
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::Discrete(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::Discrete(regs) = &state.registers else {
            return Err(wrong_variant("discrete", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!("{:?} bank=${:02X}", self.board, self.regs.bank_select)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftRegisterRegs {
    pub shift_register: u8,
    pub control: u8,
    pub chr_bank0: u8,
    pub chr_bank1: u8,
    pub prg_bank: u8,
}

impl Default for ShiftRegisterRegs {
    fn default() -> Self {
        Self {
            shift_register: SHIFT_REGISTER_EMPTY,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
        }
    }
}

// Marker bit: reaching bit 0 means four bits are already queued.
const SHIFT_REGISTER_EMPTY: u8 = 0x10;

struct ShiftRegisterMapper {
    memory: CartMemory,
    regs: ShiftRegisterRegs,
}

impl ShiftRegisterMapper {
    fn new(image: ProgramImage) -> Self {
        Self {
            memory: CartMemory::new(image),
            regs: ShiftRegisterRegs::default(),
        }
    }

    fn write_shift_register(&mut self, addr: u16, value: u8) {
        if (value & 0x80) != 0 {
            self.regs.shift_register = SHIFT_REGISTER_EMPTY;
            self.regs.control |= 0x0C;
            return;
        }

        let commit = (self.regs.shift_register & 0x01) != 0;
        self.regs.shift_register >>= 1;
        self.regs.shift_register |= (value & 0x01) << 4;

        if commit {
            let data = self.regs.shift_register;
            match addr {
                0x8000..=0x9FFF => self.regs.control = data,
                0xA000..=0xBFFF => self.regs.chr_bank0 = data,
                0xC000..=0xDFFF => self.regs.chr_bank1 = data,
                _ => self.regs.prg_bank = data,
            }
            self.regs.shift_register = SHIFT_REGISTER_EMPTY;
        }
    }

    fn prg_ram_enabled(&self) -> bool {
        (self.regs.prg_bank & 0x10) == 0
    }

    fn chr_4k_mode(&self) -> bool {
        (self.regs.control & 0x10) != 0
    }
}

impl Mapper for ShiftRegisterMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF if self.prg_ram_enabled() => self.memory.read_prg_ram(addr),
            0x6000..=0x7FFF => 0,
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF if self.prg_ram_enabled() => self.memory.write_prg_ram(addr, value),
            0x8000..=0xFFFF => self.write_shift_register(addr, value),
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x1000, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x1000, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        match self.regs.control & 0x03 {
            0 => Mirroring::OneScreenLower,
            1 => Mirroring::OneScreenUpper,
            2 => Mirroring::Vertical,
            _ => Mirroring::Horizontal,
        }
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        let bank = (self.regs.prg_bank & 0x0F) as usize;
        let bank = match (self.regs.control >> 2) & 0x03 {
            0 | 1 => (bank & !1) + usize::from(addr >= 0xC000),
            2 if addr < 0xC000 => 0,
            2 => bank,
            _ if addr < 0xC000 => bank,
            _ => self.memory.last_prg_bank(0x4000),
        };
        self.memory.prg_offset(bank, 0x4000, addr)
    }

    fn prg_bank_size(&self) -> usize {
        0x4000
    }

    fn chr_bank_for(&self, addr: u16) -> usize {
        let count = self.memory.chr_bank_count(0x1000);
        let bank = if !self.chr_4k_mode() {
            (self.regs.chr_bank0 & 0x1E) as usize + usize::from((addr & 0x1000) != 0)
        } else if (addr & 0x1000) == 0 {
            self.regs.chr_bank0 as usize
        } else {
            self.regs.chr_bank1 as usize
        };
        bank % count
    }

    fn chr_bank_size(&self) -> usize {
        0x1000
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::ShiftRegister(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::ShiftRegister(regs) = &state.registers else {
            return Err(wrong_variant("shift_register", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC1 shift=${:02X} control=${:02X} chr=({:02X},{:02X}) prg=${:02X}",
            self.regs.shift_register,
            self.regs.control,
            self.regs.chr_bank0,
            self.regs.chr_bank1,
            self.regs.prg_bank
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiBankIrqRegs {
    pub bank_select: u8,
    pub bank_regs: [u8; 8],
    pub mirroring: Mirroring,
    pub prg_ram_enabled: bool,
    pub prg_ram_write_protect: bool,
    pub irq_latch: u8,
    pub irq_counter: u8,
    pub irq_reload: bool,
    pub irq_enabled: bool,
    pub irq_pending: bool,
    pub last_a12: bool,
    pub a12_low_reads: u8,
}

// Consecutive A12-low fetches required before a rising edge counts.
const A12_FILTER_READS: u8 = 8;

struct MultiBankIrqMapper {
    memory: CartMemory,
    four_screen: bool,
    regs: MultiBankIrqRegs,
}

impl MultiBankIrqMapper {
    fn new(image: ProgramImage) -> Self {
        let regs = MultiBankIrqRegs {
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            mirroring: image.mirroring,
            prg_ram_enabled: true,
            prg_ram_write_protect: false,
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            irq_pending: false,
            last_a12: false,
            a12_low_reads: 0,
        };
        Self {
            four_screen: image.four_screen,
            memory: CartMemory::new(image),
            regs,
        }
    }

    fn clock_irq_counter(&mut self) {
        if self.regs.irq_counter == 0 || self.regs.irq_reload {
            self.regs.irq_counter = self.regs.irq_latch;
            self.regs.irq_reload = false;
        } else {
            self.regs.irq_counter -= 1;
        }

        if self.regs.irq_counter == 0 && self.regs.irq_enabled {
            self.regs.irq_pending = true;
        }
    }

    fn monitor_ppu_a12(&mut self, addr: u16) {
        let a12 = (addr & 0x1000) != 0;
        if !a12 {
            self.regs.a12_low_reads = self.regs.a12_low_reads.saturating_add(1);
        } else {
            if !self.regs.last_a12 && self.regs.a12_low_reads >= A12_FILTER_READS {
                self.clock_irq_counter();
            }
            self.regs.a12_low_reads = 0;
        }
        self.regs.last_a12 = a12;
    }

    fn chr_inverted(&self) -> bool {
        (self.regs.bank_select & 0x80) != 0
    }
}

impl Mapper for MultiBankIrqMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF if self.regs.prg_ram_enabled => self.memory.read_prg_ram(addr),
            0x6000..=0x7FFF => 0,
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        let even = (addr & 1) == 0;
        match addr {
            0x6000..=0x7FFF => {
                if self.regs.prg_ram_enabled && !self.regs.prg_ram_write_protect {
                    self.memory.write_prg_ram(addr, value);
                }
            }
            0x8000..=0x9FFF if even => self.regs.bank_select = value,
            0x8000..=0x9FFF => {
                let target = (self.regs.bank_select & 0x07) as usize;
                self.regs.bank_regs[target] = match target {
                    0 | 1 => value & 0xFE,
                    6 | 7 => value & 0x3F,
                    _ => value,
                };
            }
            0xA000..=0xBFFF if even => {
                self.regs.mirroring = if (value & 1) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                };
            }
            0xA000..=0xBFFF => {
                self.regs.prg_ram_enabled = (value & 0x80) != 0;
                self.regs.prg_ram_write_protect = (value & 0x40) != 0;
            }
            0xC000..=0xDFFF if even => self.regs.irq_latch = value,
            0xC000..=0xDFFF => {
                self.regs.irq_counter = 0;
                self.regs.irq_reload = true;
            }
            0xE000..=0xFFFF if even => {
                self.regs.irq_enabled = false;
                self.regs.irq_pending = false;
            }
            0xE000..=0xFFFF => self.regs.irq_enabled = true,
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x0400, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x0400, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        if self.four_screen {
            Mirroring::FourScreen
        } else {
            self.regs.mirroring
        }
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        let swap_low = (self.regs.bank_select & 0x40) != 0;
        let second_last = self.memory.prg_bank_count(0x2000).saturating_sub(2);
        let bank = match addr {
            0x8000..=0x9FFF if swap_low => second_last,
            0x8000..=0x9FFF => self.regs.bank_regs[6] as usize,
            0xA000..=0xBFFF => self.regs.bank_regs[7] as usize,
            0xC000..=0xDFFF if swap_low => self.regs.bank_regs[6] as usize,
            0xC000..=0xDFFF => second_last,
            0xE000..=0xFFFF => self.memory.last_prg_bank(0x2000),
            _ => return None,
        };
        self.memory.prg_offset(bank, 0x2000, addr)
    }

    fn prg_bank_size(&self) -> usize {
        0x2000
    }

    fn chr_bank_for(&self, addr: u16) -> usize {
        let mut slot = ((addr & 0x1FFF) / 0x0400) as usize;
        if self.chr_inverted() {
            slot ^= 0x04;
        }
        let r = &self.regs.bank_regs;
        let bank = match slot {
            0 => r[0] as usize,
            1 => r[0] as usize + 1,
            2 => r[1] as usize,
            3 => r[1] as usize + 1,
            _ => r[slot - 2] as usize,
        };
        bank % self.memory.chr_bank_count(0x0400)
    }

    fn chr_bank_size(&self) -> usize {
        0x0400
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::MultiBankIrq(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::MultiBankIrq(regs) = &state.registers else {
            return Err(wrong_variant("multi_bank_irq", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn clock_scanline(&mut self) {
        self.clock_irq_counter();
    }

    fn notify_ppu_read_addr(&mut self, addr: u16) {
        self.monitor_ppu_a12(addr);
    }

    fn irq_pending(&self) -> bool {
        self.regs.irq_pending
    }

    fn debug_state(&self) -> String {
        let r = &self.regs;
        format!(
            "MMC3 bank_select=${:02X} prg=[{:02X},{:02X}] chr=[{:02X},{:02X},{:02X},{:02X},{:02X},{:02X}] irq_latch=${:02X} irq_counter=${:02X} reload={} en={} pending={}",
            r.bank_select,
            r.bank_regs[6],
            r.bank_regs[7],
            r.bank_regs[0],
            r.bank_regs[1],
            r.bank_regs[2],
            r.bank_regs[3],
            r.bank_regs[4],
            r.bank_regs[5],
            r.irq_latch,
            r.irq_counter,
            r.irq_reload,
            r.irq_enabled,
            r.irq_pending
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchBoard {
    Mmc2,
    Mmc4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchChrRegs {
    pub prg_bank: u8,
    pub chr_fd_0000: u8,
    pub chr_fe_0000: u8,
    pub chr_fd_1000: u8,
    pub chr_fe_1000: u8,
    pub latch0_is_fe: bool,
    pub latch1_is_fe: bool,
    pub mirroring: Mirroring,
}

struct LatchChrMapper {
    memory: CartMemory,
    board: LatchBoard,
    regs: LatchChrRegs,
}

impl LatchChrMapper {
    fn new(image: ProgramImage, board: LatchBoard) -> Self {
        let regs = LatchChrRegs {
            prg_bank: 0,
            chr_fd_0000: 0,
            chr_fe_0000: 0,
            chr_fd_1000: 0,
            chr_fe_1000: 0,
            latch0_is_fe: true,
            latch1_is_fe: true,
            mirroring: image.mirroring,
        };
        Self {
            memory: CartMemory::new(image),
            board,
            regs,
        }
    }

    fn update_latches(&mut self, addr: u16) {
        match (self.board, addr) {
            (LatchBoard::Mmc2, 0x0FD8) => self.regs.latch0_is_fe = false,
            (LatchBoard::Mmc2, 0x0FE8) => self.regs.latch0_is_fe = true,
            (LatchBoard::Mmc4, 0x0FD8..=0x0FDF) => self.regs.latch0_is_fe = false,
            (LatchBoard::Mmc4, 0x0FE8..=0x0FEF) => self.regs.latch0_is_fe = true,
            (_, 0x1FD8..=0x1FDF) => self.regs.latch1_is_fe = false,
            (_, 0x1FE8..=0x1FEF) => self.regs.latch1_is_fe = true,
            _ => {}
        }
    }
}

impl Mapper for LatchChrMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.memory.read_prg_ram(addr),
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => self.memory.write_prg_ram(addr, value),
            0xA000..=0xAFFF => self.regs.prg_bank = value & 0x0F,
            0xB000..=0xBFFF => self.regs.chr_fd_0000 = value & 0x1F,
            0xC000..=0xCFFF => self.regs.chr_fe_0000 = value & 0x1F,
            0xD000..=0xDFFF => self.regs.chr_fd_1000 = value & 0x1F,
            0xE000..=0xEFFF => self.regs.chr_fe_1000 = value & 0x1F,
            0xF000..=0xFFFF => {
                self.regs.mirroring = if (value & 0x01) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                };
            }
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x1000, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x1000, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.regs.mirroring
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        match self.board {
            LatchBoard::Mmc2 => {
                let count = self.memory.prg_bank_count(0x2000);
                let bank = match addr {
                    0x8000..=0x9FFF => self.regs.prg_bank as usize,
                    0xA000..=0xBFFF => count.saturating_sub(3),
                    0xC000..=0xDFFF => count.saturating_sub(2),
                    _ => count - 1,
                };
                self.memory.prg_offset(bank, 0x2000, addr)
            }
            LatchBoard::Mmc4 => {
                let bank = if addr < 0xC000 {
                    self.regs.prg_bank as usize
                } else {
                    self.memory.last_prg_bank(0x4000)
                };
                self.memory.prg_offset(bank, 0x4000, addr)
            }
        }
    }

    fn prg_bank_size(&self) -> usize {
        match self.board {
            LatchBoard::Mmc2 => 0x2000,
            LatchBoard::Mmc4 => 0x4000,
        }
    }

    fn chr_bank_for(&self, addr: u16) -> usize {
        let r = &self.regs;
        let bank = if (addr & 0x1000) == 0 {
            if r.latch0_is_fe {
                r.chr_fe_0000
            } else {
                r.chr_fd_0000
            }
        } else if r.latch1_is_fe {
            r.chr_fe_1000
        } else {
            r.chr_fd_1000
        };
        bank as usize % self.memory.chr_bank_count(0x1000)
    }

    fn chr_bank_size(&self) -> usize {
        0x1000
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::LatchChr(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::LatchChr(regs) = &state.registers else {
            return Err(wrong_variant("latch_chr", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn notify_ppu_read_addr(&mut self, addr: u16) {
        self.update_latches(addr & 0x1FFF);
    }

    fn debug_state(&self) -> String {
        let r = &self.regs;
        format!(
            "{:?} prg=${:02X} latch0_fe={} latch1_fe={} chr_fd=({:02X},{:02X}) chr_fe=({:02X},{:02X})",
            self.board,
            r.prg_bank,
            r.latch0_is_fe,
            r.latch1_is_fe,
            r.chr_fd_0000,
            r.chr_fd_1000,
            r.chr_fe_0000,
            r.chr_fe_1000
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleRegisterBoard {
    AxRom,
    ColorDreams,
    GxRom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleRegisterRegs {
    pub prg_bank: u8,
    pub chr_bank: u8,
    pub mirroring: Mirroring,
}

/// 32 KiB PRG switch driven by one register anywhere in `$8000-$FFFF`.
struct SingleRegisterMapper {
    memory: CartMemory,
    board: SingleRegisterBoard,
    regs: SingleRegisterRegs,
}

impl SingleRegisterMapper {
    fn new(image: ProgramImage, board: SingleRegisterBoard) -> Self {
        let mirroring = match board {
            SingleRegisterBoard::AxRom => Mirroring::OneScreenLower,
            _ => image.mirroring,
        };
        Self {
            memory: CartMemory::new(image),
            board,
            regs: SingleRegisterRegs {
                prg_bank: 0,
                chr_bank: 0,
                mirroring,
            },
        }
    }

    fn write_register(&mut self, value: u8) {
        match self.board {
            SingleRegisterBoard::AxRom => {
                self.regs.prg_bank = value & 0x07;
                self.regs.mirroring = if (value & 0x10) != 0 {
                    Mirroring::OneScreenUpper
                } else {
                    Mirroring::OneScreenLower
                };
            }
            SingleRegisterBoard::ColorDreams => {
                self.regs.prg_bank = value & 0x03;
                self.regs.chr_bank = value >> 4;
            }
            SingleRegisterBoard::GxRom => {
                self.regs.prg_bank = (value >> 4) & 0x03;
                self.regs.chr_bank = value & 0x03;
            }
        }
    }
}

impl Mapper for SingleRegisterMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.memory.read_prg_ram(addr),
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => self.memory.write_prg_ram(addr, value),
            0x8000..=0xFFFF => self.write_register(value),
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x2000, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x2000, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.regs.mirroring
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        self.memory.prg_offset(self.regs.prg_bank as usize, 0x8000, addr)
    }

    fn prg_bank_size(&self) -> usize {
        0x8000
    }

    fn chr_bank_for(&self, _addr: u16) -> usize {
        self.regs.chr_bank as usize % self.memory.chr_bank_count(0x2000)
    }

    fn chr_bank_size(&self) -> usize {
        0x2000
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::SingleRegister(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::SingleRegister(regs) = &state.registers else {
            return Err(wrong_variant("single_register", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "{:?} prg_bank=${:02X} chr_bank=${:02X} prg_32k_banks={} mirroring={:?}",
            self.board,
            self.regs.prg_bank,
            self.regs.chr_bank,
            self.memory.prg_bank_count(0x8000),
            self.regs.mirroring
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIrqRegs {
    pub prg_banks: [u8; 4],
    pub chr_banks: [u8; 8],
    pub mirroring: Mirroring,
    pub irq_counter: u16,
    pub irq_enabled: bool,
    pub irq_pending: bool,
}

/// Copier-hack board: registers at `$42FE-$4517` and a free-running 16-bit IRQ counter.
struct CounterIrqMapper {
    memory: CartMemory,
    regs: CounterIrqRegs,
}

impl CounterIrqMapper {
    fn new(image: ProgramImage) -> Self {
        let mirroring = image.mirroring;
        let memory = CartMemory::new(image);
        let count = memory.prg_bank_count(0x2000);
        let last = (count - 1) as u8;
        let regs = CounterIrqRegs {
            prg_banks: [0, (1 % count) as u8, last.saturating_sub(1), last],
            chr_banks: [0, 1, 2, 3, 4, 5, 6, 7],
            mirroring,
            irq_counter: 0,
            irq_enabled: false,
            irq_pending: false,
        };
        Self { memory, regs }
    }
}

impl Mapper for CounterIrqMapper {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.memory.read_prg_ram(addr),
            _ => self.memory.read_prg(self.prg_rom_offset(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x42FE => {
                self.regs.mirroring = if (value & 0x10) != 0 {
                    Mirroring::OneScreenUpper
                } else {
                    Mirroring::OneScreenLower
                };
            }
            0x42FF => {
                self.regs.mirroring = if (value & 0x10) != 0 {
                    Mirroring::Horizontal
                } else {
                    Mirroring::Vertical
                };
            }
            0x4501 => {
                self.regs.irq_enabled = false;
                self.regs.irq_pending = false;
            }
            0x4502 => self.regs.irq_counter = (self.regs.irq_counter & 0xFF00) | value as u16,
            0x4503 => {
                self.regs.irq_counter = (self.regs.irq_counter & 0x00FF) | ((value as u16) << 8);
                self.regs.irq_enabled = true;
                self.regs.irq_pending = false;
            }
            0x4504..=0x4507 => self.regs.prg_banks[(addr - 0x4504) as usize] = value,
            0x4510..=0x4517 => self.regs.chr_banks[(addr - 0x4510) as usize] = value,
            0x6000..=0x7FFF => self.memory.write_prg_ram(addr, value),
            _ => {}
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let bank = self.chr_bank_for(addr);
        self.memory.chr[self.memory.chr_offset(bank, 0x0400, addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        let bank = self.chr_bank_for(addr);
        let idx = self.memory.chr_offset(bank, 0x0400, addr);
        self.memory.write_chr(idx, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.regs.mirroring
    }

    fn prg_rom_offset(&self, addr: u16) -> Option<usize> {
        if addr < PRG_WINDOW_START {
            return None;
        }
        let slot = ((addr - PRG_WINDOW_START) / 0x2000) as usize;
        self.memory.prg_offset(self.regs.prg_banks[slot] as usize, 0x2000, addr)
    }

    fn prg_bank_size(&self) -> usize {
        0x2000
    }

    fn chr_bank_for(&self, addr: u16) -> usize {
        let slot = ((addr & 0x1FFF) / 0x0400) as usize;
        self.regs.chr_banks[slot] as usize % self.memory.chr_bank_count(0x0400)
    }

    fn chr_bank_size(&self) -> usize {
        0x0400
    }

    fn prg_rom(&self) -> &[u8] {
        &self.memory.prg_rom
    }

    fn prg_rom_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_rom
    }

    fn prg_ram(&self) -> &[u8] {
        &self.memory.prg_ram
    }

    fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.memory.prg_ram
    }

    fn save_state(&self) -> MapperState {
        self.memory.save(MapperRegisters::CounterIrq(self.regs.clone()))
    }

    fn load_state(&mut self, state: &MapperState) -> Result<()> {
        let MapperRegisters::CounterIrq(regs) = &state.registers else {
            return Err(wrong_variant("counter_irq", &state.registers));
        };
        self.memory.restore_arenas(state)?;
        self.regs = regs.clone();
        Ok(())
    }

    fn tick_cpu_cycle(&mut self) {
        if !self.regs.irq_enabled {
            return;
        }
        self.regs.irq_counter = self.regs.irq_counter.wrapping_add(1);
        if self.regs.irq_counter == 0 {
            self.regs.irq_pending = true;
            self.regs.irq_enabled = false;
        }
    }

    fn irq_pending(&self) -> bool {
        self.regs.irq_pending
    }

    fn debug_state(&self) -> String {
        format!(
            "FFE prg={:02X?} chr={:02X?} irq_counter=${:04X} en={} pending={}",
            self.regs.prg_banks,
            self.regs.chr_banks,
            self.regs.irq_counter,
            self.regs.irq_enabled,
            self.regs.irq_pending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_mapper(mapper_id: u16, prg_rom: Vec<u8>, chr: Vec<u8>) -> Box<dyn Mapper> {
        let image = ProgramImage::cartridge(mapper_id, prg_rom, chr).unwrap();
        create_mapper(image).unwrap()
    }

    fn mmc1_serial_write(mapper: &mut dyn Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.cpu_write(addr, (value >> bit) & 0x01);
        }
    }

    fn assert_reads_match_offsets(mapper: &mut dyn Mapper) {
        for addr in (0x8000u32..=0xFFFF).step_by(0x0123) {
            let addr = addr as u16;
            let offset = mapper.prg_rom_offset(addr).unwrap();
            let expected = mapper.prg_rom()[offset];
            assert_eq!(mapper.cpu_read(addr), expected, "addr ${addr:04X}");
        }
    }

    #[test]
    fn fixed_mirrors_16k_image() {
        let mut prg = patterned_banks(0x4000, 0x4000);
        prg[0x0010] = 0xAB;
        let mut mapper = make_mapper(0, prg, Vec::new());
        assert_eq!(mapper.cpu_read(0x8010), 0xAB);
        assert_eq!(mapper.cpu_read(0xC010), 0xAB);
        assert_eq!(mapper.prg_bank_for(0xC010), Some(0));
    }

    #[test]
    fn fixed_sound_program_maps_from_load_address() {
        let image =
            ProgramImage::sound_program(vec![0x11, 0x22, 0x33], 0x9000, 0x9000, 0x9001, 1)
                .unwrap();
        let mut mapper = create_mapper(image).unwrap();
        assert_eq!(mapper.cpu_read(0x8FFF), 0);
        assert_eq!(mapper.cpu_read(0x9000), 0x11);
        assert_eq!(mapper.cpu_read(0x9002), 0x33);
        assert_eq!(mapper.cpu_read(0x9003), 0);
        assert_eq!(mapper.prg_rom_offset(0x9001), Some(1));
    }

    #[test]
    fn unknown_mapper_falls_back_to_fixed_layout() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = make_mapper(250, prg, Vec::new());
        assert!(!is_supported(250));
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 4);
        mapper.cpu_write(0x8000, 0x03);
        assert_eq!(mapper.cpu_read(0x8000), 1);
    }

    #[test]
    fn rom_window_writes_never_touch_rom() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = make_mapper(2, prg.clone(), Vec::new());
        mapper.cpu_write(0x8000, 0x02);
        mapper.cpu_write(0xC123, 0xFF);
        assert_eq!(mapper.prg_rom(), prg.as_slice());
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let mut mapper = make_mapper(2, prg, Vec::new());

        mapper.cpu_write(0x8000, 1);
        assert_eq!(mapper.cpu_read(0x8000), 2);
        assert_eq!(mapper.cpu_read(0xC000), 3);
        assert_eq!(mapper.prg_bank_for(0x8000), Some(1));
        assert_eq!(mapper.prg_bank_for(0xC000), Some(2));
    }

    #[test]
    fn cnrom_switches_chr_bank() {
        let prg = patterned_banks(0x8000, 0x4000);
        let chr = patterned_banks(4 * 0x2000, 0x2000);
        let mut mapper = make_mapper(3, prg, chr);

        mapper.cpu_write(0x8000, 3);
        assert_eq!(mapper.ppu_read(0x0000), 4);
        assert_eq!(mapper.chr_bank_for(0x1FFF), 3);
        mapper.cpu_write(0x8000, 0);
        assert_eq!(mapper.ppu_read(0x0000), 1);
    }

    #[test]
    fn chr_ram_accepts_writes_and_rom_does_not() {
        let prg = patterned_banks(0x8000, 0x4000);
        let mut ram_board = make_mapper(0, prg.clone(), Vec::new());
        ram_board.ppu_write(0x0010, 0xAB);
        assert_eq!(ram_board.ppu_read(0x0010), 0xAB);

        let mut rom_board = make_mapper(0, prg, patterned_banks(0x2000, 0x2000));
        rom_board.ppu_write(0x0010, 0xAB);
        assert_eq!(rom_board.ppu_read(0x0010), 1);
    }

    #[test]
    fn mmc1_commits_only_on_fifth_write() {
        let prg = patterned_banks(8 * 0x4000, 0x4000);
        let mut mapper = make_mapper(1, prg, Vec::new());

        let writes = [0b10000u8, 0b00001, 0b00000, 0b00000];
        for value in writes {
            mapper.cpu_write(0xE000, value);
            assert_eq!(mapper.cpu_read(0x8000), 1);
        }
        mapper.cpu_write(0xE000, 0b00001);

        // Serial bits 0,1,0,0,1 assemble to %10010: bank 2, work RAM disabled.
        assert_eq!(mapper.cpu_read(0x8000), 3);
        assert_eq!(mapper.prg_bank_for(0x8000), Some(2));
        assert_eq!(mapper.cpu_read(0xC000), 8);
        mapper.cpu_write(0x6000, 0x55);
        assert_eq!(mapper.cpu_read(0x6000), 0);
    }

    #[test]
    fn mmc1_reset_bit_discards_partial_shift() {
        let prg = patterned_banks(8 * 0x4000, 0x4000);
        let mut mapper = make_mapper(1, prg, Vec::new());

        mapper.cpu_write(0xE000, 1);
        mapper.cpu_write(0xE000, 1);
        mapper.cpu_write(0x8000, 0x80);
        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x05);
        assert_eq!(mapper.cpu_read(0x8000), 6);
    }

    #[test]
    fn mmc1_edge_banks_and_modes() {
        let prg = patterned_banks(16 * 0x4000, 0x4000);
        let chr = patterned_banks(4 * 0x1000, 0x1000);
        let mut mapper = make_mapper(1, prg, chr);

        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x0F);
        assert_eq!(mapper.cpu_read(0x8000), 16);
        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x00);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xFFFF), 16);

        // Mode 2: $8000 fixed to bank 0, $C000 switchable.
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x08 | 0x02);
        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x05);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 6);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);

        // Mode 0: 32K switch ignores bit 0.
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x00);
        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x03);
        assert_eq!(mapper.cpu_read(0x8000), 3);
        assert_eq!(mapper.cpu_read(0xC000), 4);

        // 4K CHR mode.
        mmc1_serial_write(mapper.as_mut(), 0x8000, 0x10);
        mmc1_serial_write(mapper.as_mut(), 0xA000, 0x03);
        mmc1_serial_write(mapper.as_mut(), 0xC000, 0x01);
        assert_eq!(mapper.ppu_read(0x0000), 4);
        assert_eq!(mapper.ppu_read(0x1000), 2);
        assert_reads_match_offsets(mapper.as_mut());
    }

    #[test]
    fn mmc1_repeated_sequence_is_idempotent() {
        let prg = patterned_banks(8 * 0x4000, 0x4000);
        let mut mapper = make_mapper(1, prg, Vec::new());

        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x04);
        let first: Vec<u8> = (0x8000..0x8010).map(|a| mapper.cpu_read(a)).collect();
        mmc1_serial_write(mapper.as_mut(), 0xE000, 0x04);
        let second: Vec<u8> = (0x8000..0x8010).map(|a| mapper.cpu_read(a)).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], 5);
    }

    #[test]
    fn mmc3_prg_modes_and_edge_banks() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x0400, 0x0400);
        let mut mapper = make_mapper(4, prg, chr);

        mapper.cpu_write(0x8000, 0x06);
        mapper.cpu_write(0x8001, 0x03);
        mapper.cpu_write(0x8000, 0x07);
        mapper.cpu_write(0x8001, 0x07);
        assert_eq!(mapper.cpu_read(0x8000), 4);
        assert_eq!(mapper.cpu_read(0xA000), 8);
        assert_eq!(mapper.cpu_read(0xC000), 7);
        assert_eq!(mapper.cpu_read(0xE000), 8);

        mapper.cpu_write(0x8000, 0x46);
        assert_eq!(mapper.cpu_read(0x8000), 7);
        assert_eq!(mapper.cpu_read(0xC000), 4);

        mapper.cpu_write(0x8000, 0x06);
        mapper.cpu_write(0x8001, 0x00);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_reads_match_offsets(mapper.as_mut());
    }

    #[test]
    fn mmc3_chr_inversion() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x0400, 0x0400);
        let mut mapper = make_mapper(4, prg, chr);

        mapper.cpu_write(0x8000, 0x02);
        mapper.cpu_write(0x8001, 0x05);
        mapper.cpu_write(0x8000, 0x00);
        mapper.cpu_write(0x8001, 0x03);
        assert_eq!(mapper.ppu_read(0x1000), 6);
        assert_eq!(mapper.ppu_read(0x0000), 3);
        assert_eq!(mapper.ppu_read(0x0400), 4);

        mapper.cpu_write(0x8000, 0x80);
        assert_eq!(mapper.ppu_read(0x0000), 6);
        assert_eq!(mapper.ppu_read(0x1000), 3);
        assert_eq!(mapper.chr_bank_for(0x1400), 3);
    }

    #[test]
    fn mmc3_irq_a12_edge_filtering() {
        let prg = patterned_banks(4 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x0400, 0x0400);
        let mut mapper = make_mapper(4, prg, chr);

        mapper.cpu_write(0xC000, 0x01);
        mapper.cpu_write(0xC001, 0x00);
        mapper.cpu_write(0xE001, 0x00);

        for _ in 0..8 {
            mapper.notify_ppu_read_addr(0x0000);
        }
        mapper.notify_ppu_read_addr(0x1000);
        assert!(!mapper.irq_pending());

        // A short low run is filtered out.
        mapper.notify_ppu_read_addr(0x0000);
        mapper.notify_ppu_read_addr(0x1000);
        assert!(!mapper.irq_pending());

        for _ in 0..8 {
            mapper.notify_ppu_read_addr(0x0000);
        }
        mapper.notify_ppu_read_addr(0x1000);
        assert!(mapper.irq_pending());
    }

    #[test]
    fn mmc3_scanline_counter_reload_and_ack() {
        let prg = patterned_banks(4 * 0x2000, 0x2000);
        let mut mapper = make_mapper(4, prg, Vec::new());

        mapper.cpu_write(0xC000, 0x02);
        mapper.cpu_write(0xC001, 0x00);
        mapper.cpu_write(0xE001, 0x00);

        mapper.clock_scanline();
        mapper.clock_scanline();
        assert!(!mapper.irq_pending());
        mapper.clock_scanline();
        assert!(mapper.irq_pending());

        mapper.cpu_write(0xE000, 0x00);
        assert!(!mapper.irq_pending());
        mapper.clock_scanline();
        mapper.clock_scanline();
        mapper.clock_scanline();
        assert!(!mapper.irq_pending());
    }

    #[test]
    fn mmc3_prg_ram_protect() {
        let prg = patterned_banks(4 * 0x2000, 0x2000);
        let mut mapper = make_mapper(4, prg, Vec::new());

        mapper.cpu_write(0x6000, 0xAA);
        assert_eq!(mapper.cpu_read(0x6000), 0xAA);
        mapper.cpu_write(0xA001, 0xC0);
        mapper.cpu_write(0x6000, 0x55);
        assert_eq!(mapper.cpu_read(0x6000), 0xAA);
        mapper.cpu_write(0xA001, 0x00);
        assert_eq!(mapper.cpu_read(0x6000), 0);
    }

    #[test]
    fn mmc2_latches_control_chr_windows() {
        let prg = patterned_banks(4 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x1000, 0x1000);
        let mut mapper = make_mapper(9, prg, chr);

        mapper.cpu_write(0xB000, 0x01);
        mapper.cpu_write(0xC000, 0x02);
        mapper.cpu_write(0xD000, 0x03);
        mapper.cpu_write(0xE000, 0x04);

        assert_eq!(mapper.ppu_read(0x0000), 3);
        mapper.notify_ppu_read_addr(0x0FD8);
        assert_eq!(mapper.ppu_read(0x0000), 2);
        // MMC2 only latches on the exact address for the low window.
        mapper.notify_ppu_read_addr(0x0FE9);
        assert_eq!(mapper.ppu_read(0x0000), 2);

        assert_eq!(mapper.ppu_read(0x1000), 5);
        mapper.notify_ppu_read_addr(0x1FDB);
        assert_eq!(mapper.ppu_read(0x1000), 4);
        mapper.notify_ppu_read_addr(0x1FE8);
        assert_eq!(mapper.ppu_read(0x1000), 5);
    }

    #[test]
    fn mmc2_prg_window_and_fixed_banks() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let mut mapper = make_mapper(9, prg, patterned_banks(2 * 0x1000, 0x1000));

        mapper.cpu_write(0xA000, 0x04);
        assert_eq!(mapper.cpu_read(0x8000), 5);
        assert_eq!(mapper.cpu_read(0xA000), 6);
        assert_eq!(mapper.cpu_read(0xC000), 7);
        assert_eq!(mapper.cpu_read(0xE000), 8);
        assert_reads_match_offsets(mapper.as_mut());
    }

    #[test]
    fn mmc4_switches_prg_and_chr_latches() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let chr = patterned_banks(8 * 0x1000, 0x1000);
        let mut mapper = make_mapper(10, prg, chr);

        mapper.cpu_write(0xA000, 0x01);
        assert_eq!(mapper.cpu_read(0x8000), 2);
        assert_eq!(mapper.cpu_read(0xC000), 3);

        mapper.cpu_write(0xB000, 0x00);
        mapper.cpu_write(0xC000, 0x01);
        assert_eq!(mapper.ppu_read(0x0000), 2);
        mapper.notify_ppu_read_addr(0x0FDA);
        assert_eq!(mapper.ppu_read(0x0000), 1);
        mapper.cpu_write(0xF000, 0x01);
        assert_eq!(mapper.mirroring(), Mirroring::Horizontal);
    }

    #[test]
    fn axrom_switches_prg_and_onescreen_mirroring() {
        let prg = patterned_banks(2 * 0x8000, 0x8000);
        let mut mapper = make_mapper(7, prg, Vec::new());

        assert_eq!(mapper.mirroring(), Mirroring::OneScreenLower);
        mapper.cpu_write(0x8000, 0x11);
        assert_eq!(mapper.cpu_read(0x8000), 2);
        assert_eq!(mapper.cpu_read(0xFFFF), 2);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenUpper);
        mapper.cpu_write(0x8000, 0x00);
        assert_eq!(mapper.cpu_read(0x8000), 1);
    }

    #[test]
    fn gxrom_and_color_dreams_decode_their_register() {
        let prg = patterned_banks(4 * 0x8000, 0x8000);
        let chr = patterned_banks(4 * 0x2000, 0x2000);

        let mut gxrom = make_mapper(66, prg.clone(), chr.clone());
        gxrom.cpu_write(0x8000, 0x31);
        assert_eq!(gxrom.cpu_read(0x8000), 4);
        assert_eq!(gxrom.ppu_read(0x0000), 2);

        let mut color_dreams = make_mapper(11, prg, chr);
        color_dreams.cpu_write(0xFFF0, 0x21);
        assert_eq!(color_dreams.cpu_read(0x8000), 2);
        assert_eq!(color_dreams.ppu_read(0x0000), 3);
        assert_reads_match_offsets(color_dreams.as_mut());
    }

    #[test]
    fn counter_irq_banks_and_overflow() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x0400, 0x0400);
        let mut mapper = make_mapper(17, prg, chr);

        assert_eq!(mapper.cpu_read(0xE000), 8);
        mapper.cpu_write(0x4504, 0x03);
        assert_eq!(mapper.cpu_read(0x8000), 4);
        mapper.cpu_write(0x4512, 0x05);
        assert_eq!(mapper.ppu_read(0x0800), 6);

        mapper.tick_cpu_cycle();
        assert!(!mapper.irq_pending());

        mapper.cpu_write(0x4502, 0xFE);
        mapper.cpu_write(0x4503, 0xFF);
        mapper.tick_cpu_cycle();
        assert!(!mapper.irq_pending());
        mapper.tick_cpu_cycle();
        assert!(mapper.irq_pending());

        mapper.cpu_write(0x4501, 0x00);
        assert!(!mapper.irq_pending());
        assert_reads_match_offsets(mapper.as_mut());
    }

    #[test]
    fn state_round_trip_restores_banking() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let mut mapper = make_mapper(4, prg.clone(), Vec::new());
        mapper.cpu_write(0x8000, 0x06);
        mapper.cpu_write(0x8001, 0x05);
        mapper.cpu_write(0x6000, 0x42);
        let saved = mapper.save_state();

        let mut fresh = make_mapper(4, prg.clone(), Vec::new());
        assert_eq!(fresh.cpu_read(0x8000), 1);
        fresh.load_state(&saved).unwrap();
        assert_eq!(fresh.cpu_read(0x8000), 6);
        assert_eq!(fresh.cpu_read(0x6000), 0x42);

        let mut other = make_mapper(2, patterned_banks(4 * 0x4000, 0x4000), Vec::new());
        assert!(other.load_state(&saved).is_err());
    }

    struct BankSelectCase {
        board: &'static str,
        mapper_id: u16,
        prg_size: usize,
        bank_size: usize,
        max_bank: u8,
        select: fn(&mut dyn Mapper, u8),
    }

    fn rom_window_reads(mapper: &mut dyn Mapper) -> Vec<u8> {
        (0x8000u32..=0xFFFF)
            .step_by(0x0123)
            .map(|addr| mapper.cpu_read(addr as u16))
            .collect()
    }

    #[test]
    fn every_board_selects_first_and_last_bank_idempotently() {
        let cases = [
            BankSelectCase {
                board: "NROM",
                mapper_id: 0,
                prg_size: 0x8000,
                bank_size: 0x4000,
                max_bank: 0,
                select: |m, bank| m.cpu_write(0x8000, bank),
            },
            BankSelectCase {
                board: "UxROM",
                mapper_id: 2,
                prg_size: 8 * 0x4000,
                bank_size: 0x4000,
                max_bank: 7,
                select: |m, bank| m.cpu_write(0x8000, bank),
            },
            BankSelectCase {
                board: "MMC1",
                mapper_id: 1,
                prg_size: 8 * 0x4000,
                bank_size: 0x4000,
                max_bank: 7,
                select: |m, bank| mmc1_serial_write(m, 0xE000, bank),
            },
            BankSelectCase {
                board: "MMC3",
                mapper_id: 4,
                prg_size: 16 * 0x2000,
                bank_size: 0x2000,
                max_bank: 15,
                select: |m, bank| {
                    m.cpu_write(0x8000, 0x06);
                    m.cpu_write(0x8001, bank);
                },
            },
            BankSelectCase {
                board: "MMC2",
                mapper_id: 9,
                prg_size: 16 * 0x2000,
                bank_size: 0x2000,
                max_bank: 15,
                select: |m, bank| m.cpu_write(0xA000, bank),
            },
            BankSelectCase {
                board: "MMC4",
                mapper_id: 10,
                prg_size: 8 * 0x4000,
                bank_size: 0x4000,
                max_bank: 7,
                select: |m, bank| m.cpu_write(0xA000, bank),
            },
            BankSelectCase {
                board: "AxROM",
                mapper_id: 7,
                prg_size: 8 * 0x8000,
                bank_size: 0x8000,
                max_bank: 7,
                select: |m, bank| m.cpu_write(0x8000, bank),
            },
            BankSelectCase {
                board: "Color Dreams",
                mapper_id: 11,
                prg_size: 4 * 0x8000,
                bank_size: 0x8000,
                max_bank: 3,
                select: |m, bank| m.cpu_write(0x8000, bank),
            },
            BankSelectCase {
                board: "GxROM",
                mapper_id: 66,
                prg_size: 4 * 0x8000,
                bank_size: 0x8000,
                max_bank: 3,
                select: |m, bank| m.cpu_write(0x8000, bank << 4),
            },
            BankSelectCase {
                board: "FFE F8xxx",
                mapper_id: 17,
                prg_size: 16 * 0x2000,
                bank_size: 0x2000,
                max_bank: 15,
                select: |m, bank| m.cpu_write(0x4504, bank),
            },
        ];

        for case in &cases {
            let prg = patterned_banks(case.prg_size, case.bank_size);
            let mut mapper = make_mapper(case.mapper_id, prg, Vec::new());
            let board = case.board;

            for bank in [0, case.max_bank, 0] {
                (case.select)(mapper.as_mut(), bank);
                assert_eq!(mapper.cpu_read(0x8000), bank + 1, "{board} bank {bank}");
                assert_eq!(
                    mapper.prg_bank_for(0x8000),
                    Some(bank as usize),
                    "{board} bank {bank}"
                );
                assert_reads_match_offsets(mapper.as_mut());
                let reads = rom_window_reads(mapper.as_mut());
                let registers = mapper.save_state().registers;

                (case.select)(mapper.as_mut(), bank);
                assert_eq!(rom_window_reads(mapper.as_mut()), reads, "{board} bank {bank}");
                assert_eq!(mapper.save_state().registers, registers, "{board} bank {bank}");
            }
        }
    }
}
