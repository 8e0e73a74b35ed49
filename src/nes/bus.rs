//! CPU address decoding.
//!
//! $0000-$1FFF internal RAM (2 KiB, mirrored)
//! $2000-$3FFF picture-unit registers (not emulated, read as 0)
//! $4000-$4017 APU registers; $4014/$4016/$4018-$401F I/O (not emulated)
//! $4020-$FFFF cartridge space, routed to the mapper

use super::apu::Apu;
use super::cpu::CpuBus;
use super::mapper::Mapper;

pub const RAM_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusCounters {
    pub reads_ram: u64,
    pub writes_ram: u64,
    pub reads_ppu_regs: u64,
    pub writes_ppu_regs: u64,
    pub reads_apu_io: u64,
    pub writes_apu_io: u64,
    pub reads_cartridge: u64,
    pub writes_cartridge: u64,
    pub chr_reads: u64,
    pub chr_writes: u64,
}

pub struct Bus {
    pub(crate) ram: [u8; RAM_SIZE],
    pub(crate) apu: Apu,
    pub(crate) mapper: Option<Box<dyn Mapper>>,
    counters: BusCounters,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            ram: [0; RAM_SIZE],
            apu: Apu::new(),
            mapper: None,
            counters: BusCounters::default(),
        }
    }

    pub fn attach_mapper(&mut self, mapper: Box<dyn Mapper>) {
        self.mapper = Some(mapper);
    }

    pub fn mapper(&self) -> Option<&dyn Mapper> {
        self.mapper.as_deref()
    }

    pub fn mapper_mut(&mut self) -> Option<&mut (dyn Mapper + 'static)> {
        self.mapper.as_deref_mut()
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn apu_mut(&mut self) -> &mut Apu {
        &mut self.apu
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn clear_ram(&mut self) {
        self.ram = [0; RAM_SIZE];
    }

    pub fn counters(&self) -> BusCounters {
        self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters = BusCounters::default();
    }

    /// Level of the shared IRQ line: APU frame interrupt or mapper interrupt.
    pub fn irq_line(&self) -> bool {
        let mapper_irq = self
            .mapper
            .as_ref()
            .is_some_and(|mapper| mapper.irq_pending());
        self.apu.irq_pending() || mapper_irq
    }

    pub fn tick_mapper(&mut self, cycles: u32) {
        if let Some(mapper) = self.mapper.as_mut() {
            for _ in 0..cycles {
                mapper.tick_cpu_cycle();
            }
        }
    }

    /// Pattern-table fetch on behalf of an external renderer.
    pub fn chr_read(&mut self, addr: u16) -> u8 {
        self.counters.chr_reads = self.counters.chr_reads.wrapping_add(1);
        let addr = addr & 0x1FFF;
        match self.mapper.as_mut() {
            Some(mapper) => {
                let value = mapper.ppu_read(addr);
                mapper.notify_ppu_read_addr(addr);
                value
            }
            None => 0,
        }
    }

    pub fn chr_write(&mut self, addr: u16, value: u8) {
        self.counters.chr_writes = self.counters.chr_writes.wrapping_add(1);
        if let Some(mapper) = self.mapper.as_mut() {
            mapper.ppu_write(addr & 0x1FFF, value);
        }
    }
}

impl CpuBus for Bus {
    fn read_byte(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => {
                self.counters.reads_ram = self.counters.reads_ram.wrapping_add(1);
                self.ram[(addr as usize) & 0x07FF]
            }
            0x2000..=0x3FFF => {
                self.counters.reads_ppu_regs = self.counters.reads_ppu_regs.wrapping_add(1);
                0
            }
            0x4015 => {
                self.counters.reads_apu_io = self.counters.reads_apu_io.wrapping_add(1);
                self.apu.read_status()
            }
            0x4000..=0x401F => {
                self.counters.reads_apu_io = self.counters.reads_apu_io.wrapping_add(1);
                0
            }
            _ => {
                self.counters.reads_cartridge = self.counters.reads_cartridge.wrapping_add(1);
                self.mapper
                    .as_mut()
                    .map_or(0, |mapper| mapper.cpu_read(addr))
            }
        }
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => {
                self.counters.writes_ram = self.counters.writes_ram.wrapping_add(1);
                self.ram[(addr as usize) & 0x07FF] = value;
            }
            0x2000..=0x3FFF => {
                self.counters.writes_ppu_regs = self.counters.writes_ppu_regs.wrapping_add(1);
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => {
                self.counters.writes_apu_io = self.counters.writes_apu_io.wrapping_add(1);
                self.apu.write_register(addr, value);
            }
            0x4014 | 0x4016 | 0x4018..=0x401F => {
                self.counters.writes_apu_io = self.counters.writes_apu_io.wrapping_add(1);
            }
            _ => {
                self.counters.writes_cartridge = self.counters.writes_cartridge.wrapping_add(1);
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value);
                }
            }
        }
    }
}
