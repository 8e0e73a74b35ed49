pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod config;
pub mod cpu;
pub mod mapper;
pub mod patch;
pub mod snapshot;

use anyhow::{Context, Result, bail};
use std::collections::VecDeque;

use bus::{Bus, BusCounters, RAM_SIZE};
use cartridge::{ProgramImage, SoundProgram};
use config::NesConfig;
use cpu::{Cpu, Halt};
use mapper::{create_mapper, is_supported, mapper_name};
use patch::{PatchCode, PatchId, RomPatcher};
use snapshot::{SNAPSHOT_VERSION, Snapshot};

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

const MAX_DEBUG_EVENTS: usize = 512;

// Return address for init/play calls; nothing executes from the I/O page.
const ROUTINE_SENTINEL: u16 = 0x4100;

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub cpu_steps: u64,
    pub cpu_cycles: u64,
    pub nmi_serviced_count: u64,
    pub irq_serviced_count: u64,
    pub sequencer_steps: u64,
    pub scanline_events: u64,
    pub routine_calls: u64,
    pub bus: BusCounters,
}

/// Position inside the current host frame, in CPU cycles, plus the next
/// sequencer step and scanline boundary still to fire.
#[derive(Debug, Clone, Copy, Default)]
struct FrameClock {
    position: u32,
    next_step: u32,
    next_line: u32,
}

pub struct Nes {
    cpu: Cpu,
    bus: Bus,
    config: NesConfig,
    patcher: RomPatcher,

    mapper_name: String,
    mapper_id: Option<u16>,
    rom_sha1: Option<String>,
    sound: Option<SoundProgram>,
    battery_backed: bool,

    pending_nmi: bool,
    halt_reported: bool,
    clock: FrameClock,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            config: NesConfig::default(),
            patcher: RomPatcher::new(),
            mapper_name: "No program loaded".to_string(),
            mapper_id: None,
            rom_sha1: None,
            sound: None,
            battery_backed: false,
            pending_nmi: false,
            halt_reported: false,
            clock: FrameClock::default(),
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    pub fn with_config(config: NesConfig) -> Result<Self> {
        let mut nes = Self::new();
        nes.apply_config(config)?;
        Ok(nes)
    }

    pub fn apply_config(&mut self, config: NesConfig) -> Result<()> {
        config.validate()?;
        self.bus.apu.set_sample_rate(config.sample_rate);
        self.bus.apu.set_mixing(config.mixing);
        self.config = config;
        self.clock = FrameClock::default();
        Ok(())
    }

    pub fn config(&self) -> &NesConfig {
        &self.config
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn mapper_id(&self) -> Option<u16> {
        self.mapper_id
    }

    pub fn has_program(&self) -> bool {
        self.bus.mapper.is_some()
    }

    pub fn sound_program(&self) -> Option<SoundProgram> {
        self.sound
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Direct bus access for hosts that drive pattern fetches through `Bus::chr_read`.
    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn halt(&self) -> Option<Halt> {
        self.cpu.halt()
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        NesDebugCounters {
            bus: self.bus.counters(),
            ..self.debug
        }
    }

    pub fn debug_mapper_state(&self) -> String {
        if let Some(mapper) = self.bus.mapper() {
            let state = mapper.debug_state();
            if state.is_empty() {
                self.mapper_name.clone()
            } else {
                state
            }
        } else {
            "No mapper".to_string()
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    pub fn load(&mut self, image: ProgramImage) -> Result<()> {
        let mapper_id = image.mapper_id;
        let rom_sha1 = image.fingerprint();
        let sound = image.sound;
        let battery_backed = image.has_battery_backed_ram;
        let name = mapper_name(mapper_id);
        let mapper = create_mapper(image)
            .with_context(|| format!("failed to create mapper {mapper_id}"))?;

        self.bus.attach_mapper(mapper);
        self.bus.clear_ram();
        self.patcher = RomPatcher::new();
        self.mapper_id = Some(mapper_id);
        self.rom_sha1 = Some(rom_sha1);
        self.sound = sound;
        self.battery_backed = battery_backed;
        self.mapper_name = match sound {
            Some(program) => format!(
                "Sound program ({} tracks, play=${:04X})",
                program.track_count, program.play_addr
            ),
            None => format!("{name} (mapper {mapper_id})"),
        };

        self.reset();
        self.push_debug_event(format!("Program loaded: {}", self.mapper_name));
        if !is_supported(mapper_id) {
            self.push_debug_event(format!(
                "Mapper {mapper_id} has no dedicated board, fallback to fixed mapping"
            ));
        }
        Ok(())
    }

    /// Work RAM of a battery-backed cartridge, for the host to persist between sessions.
    pub fn battery_ram(&self) -> Option<&[u8]> {
        if !self.battery_backed {
            return None;
        }
        self.bus.mapper().map(|mapper| mapper.prg_ram())
    }

    pub fn load_battery_ram(&mut self, data: &[u8]) -> Result<()> {
        if !self.battery_backed {
            bail!("loaded image has no battery-backed RAM");
        }
        let ram = self
            .bus
            .mapper_mut()
            .context("no program loaded")?
            .prg_ram_mut();
        if data.len() != ram.len() {
            bail!(
                "battery RAM is {} bytes, cartridge has {}",
                data.len(),
                ram.len()
            );
        }
        ram.copy_from_slice(data);
        self.push_debug_event(format!("Battery RAM loaded ({} bytes)", data.len()));
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.bus.mapper.is_none() {
            return;
        }

        self.bus.apu.reset();
        self.bus.reset_counters();
        self.cpu.reset(&mut self.bus);
        self.pending_nmi = false;
        self.halt_reported = false;
        self.clock = FrameClock::default();
        self.debug = NesDebugCounters::default();
        self.debug_events.clear();
        self.push_debug_event(format!("CPU reset, PC=${:04X}", self.cpu.pc));
    }

    /// Latches a non-maskable interrupt, taken after the next instruction.
    pub fn request_nmi(&mut self) {
        self.pending_nmi = true;
    }

    /// Executes one instruction, clocks the mapper and services pending interrupts.
    pub fn step(&mut self) -> Result<u32> {
        if self.bus.mapper.is_none() {
            bail!("no program loaded");
        }
        if let Some(halt) = self.cpu.halt() {
            bail!(
                "CPU halted on opcode ${:02X} at PC=${:04X}",
                halt.opcode,
                halt.pc
            );
        }

        let mut cycles = self.cpu.step(&mut self.bus);
        self.debug.cpu_steps = self.debug.cpu_steps.wrapping_add(1);
        self.bus.tick_mapper(cycles);

        if let Some(halt) = self.cpu.halt() {
            if !self.halt_reported {
                self.halt_reported = true;
                self.push_debug_event(format!(
                    "CPU halted on opcode ${:02X} at PC=${:04X}",
                    halt.opcode, halt.pc
                ));
            }
            bail!(
                "CPU halted on opcode ${:02X} at PC=${:04X}",
                halt.opcode,
                halt.pc
            );
        }

        let interrupt_cycles = self.service_interrupts();
        self.bus.tick_mapper(interrupt_cycles);
        cycles += interrupt_cycles;
        self.debug.cpu_cycles = self.debug.cpu_cycles.wrapping_add(cycles as u64);
        Ok(cycles)
    }

    fn service_interrupts(&mut self) -> u32 {
        if self.pending_nmi {
            self.pending_nmi = false;
            let cycles = self.cpu.nmi(&mut self.bus);
            self.debug.nmi_serviced_count = self.debug.nmi_serviced_count.wrapping_add(1);
            self.push_debug_event(format!("NMI serviced, PC=${:04X}", self.cpu.pc));
            return cycles;
        }

        if !self.bus.irq_line() {
            return 0;
        }
        let cycles = self.cpu.irq(&mut self.bus);
        if cycles > 0 {
            self.debug.irq_serviced_count = self.debug.irq_serviced_count.wrapping_add(1);
            self.push_debug_event(format!(
                "IRQ serviced at CPU cycle {}, PC=${:04X}",
                self.cpu.total_cycles(),
                self.cpu.pc
            ));
        }
        cycles
    }

    /// Runs one host frame of CPU cycles. Cycles overshooting the frame carry into the next one.
    pub fn run_frame(&mut self) -> Result<()> {
        if self.bus.mapper.is_none() {
            bail!("no program loaded");
        }

        let cycles_per_frame = self.config.cycles_per_frame;
        while self.clock.position < cycles_per_frame {
            let cycles = self.step()?;
            self.clock.position += cycles;
            self.advance_frame_events();
        }

        self.clock = FrameClock {
            position: self.clock.position - cycles_per_frame,
            ..FrameClock::default()
        };
        self.debug.frame_count = self.debug.frame_count.wrapping_add(1);
        Ok(())
    }

    fn advance_frame_events(&mut self) {
        let cycles_per_frame = self.config.cycles_per_frame as u64;
        let position = self.clock.position as u64;

        let steps = self.config.sequencer_steps_per_frame;
        while self.clock.next_step < steps
            && (self.clock.next_step as u64 + 1) * cycles_per_frame / steps as u64 <= position
        {
            self.clock.next_step += 1;
            self.bus.apu.step_frame();
            self.debug.sequencer_steps = self.debug.sequencer_steps.wrapping_add(1);
        }

        if !self.config.synthesize_scanlines {
            return;
        }
        let lines = self.config.scanlines_per_frame;
        while self.clock.next_line < lines
            && (self.clock.next_line as u64 + 1) * cycles_per_frame / lines as u64 <= position
        {
            let line = self.clock.next_line;
            self.clock.next_line += 1;
            // Visible lines and the pre-render line clock the counter.
            if line < self.config.visible_scanlines || line + 1 == lines {
                if let Some(mapper) = self.bus.mapper_mut() {
                    mapper.clock_scanline();
                }
                self.debug.scanline_events = self.debug.scanline_events.wrapping_add(1);
            }
        }
    }

    pub fn output_audio(&mut self, buffer: &mut [u8]) {
        self.bus.apu.output(buffer);
    }

    /// Starts a track of the loaded sound program. RAM, work RAM and the APU are cleared,
    /// then `init` runs with A = track.
    pub fn init_track(&mut self, track: u8) -> Result<()> {
        let program = self.sound.context("loaded image is not a sound program")?;
        if track >= program.track_count {
            bail!(
                "track {track} out of range, program has {} tracks",
                program.track_count
            );
        }

        self.bus.clear_ram();
        if let Some(mapper) = self.bus.mapper_mut() {
            mapper.prg_ram_mut().fill(0);
        }
        self.bus.apu.reset();
        self.cpu.reset(&mut self.bus);
        self.halt_reported = false;
        self.pending_nmi = false;
        self.bus.apu.write_register(0x4015, 0x0F);
        self.bus.apu.write_register(0x4017, 0x40);

        self.cpu.a = track;
        self.cpu.x = 0;
        self.call_routine(program.init_addr)?;
        self.push_debug_event(format!("Track {track} initialized"));
        Ok(())
    }

    /// Calls the play routine once, then advances the frame sequencer one frame.
    pub fn play_frame(&mut self) -> Result<()> {
        let program = self.sound.context("loaded image is not a sound program")?;
        self.call_routine(program.play_addr)?;
        for _ in 0..self.config.sequencer_steps_per_frame {
            self.bus.apu.step_frame();
            self.debug.sequencer_steps = self.debug.sequencer_steps.wrapping_add(1);
        }
        self.debug.frame_count = self.debug.frame_count.wrapping_add(1);
        Ok(())
    }

    fn call_routine(&mut self, addr: u16) -> Result<()> {
        self.cpu.prepare_call(&mut self.bus, addr, ROUTINE_SENTINEL);
        self.debug.routine_calls = self.debug.routine_calls.wrapping_add(1);

        let budget = self.config.routine_cycle_budget;
        let start = self.cpu.total_cycles();
        while self.cpu.pc != ROUTINE_SENTINEL {
            self.step()
                .with_context(|| format!("routine at ${addr:04X} stopped"))?;
            if self.cpu.total_cycles() - start > budget {
                self.push_debug_event(format!(
                    "Routine ${addr:04X} exceeded {budget} cycles at PC=${:04X}",
                    self.cpu.pc
                ));
                bail!("routine at ${addr:04X} did not return within {budget} cycles");
            }
        }
        Ok(())
    }

    pub fn apply_patch(&mut self, code: &str) -> Result<PatchId> {
        let code = PatchCode::decode(code)?;
        let mapper = self.bus.mapper_mut().context("no program loaded")?;
        let id = self.patcher.apply(mapper, &code)?;
        self.push_debug_event(format!(
            "Patch {code} applied: ${:04X} := ${:02X}",
            code.address, code.value
        ));
        Ok(id)
    }

    pub fn restore_patch(&mut self, id: PatchId) -> Result<()> {
        let mapper = self.bus.mapper_mut().context("no program loaded")?;
        let code = self.patcher.restore(mapper, id)?;
        self.push_debug_event(format!("Patch {code} restored"));
        Ok(())
    }

    pub fn restore_patches(&mut self) -> usize {
        let Some(mapper) = self.bus.mapper_mut() else {
            return 0;
        };
        let count = self.patcher.restore_all(mapper);
        if count > 0 {
            self.push_debug_event(format!("Restored {count} patches"));
        }
        count
    }

    pub fn active_patches(&self) -> Vec<(PatchId, PatchCode)> {
        self.patcher.active().collect()
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let mapper = self.bus.mapper().context("no program loaded")?;
        let rom_sha1 = self.rom_sha1.clone().context("no program loaded")?;
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            rom_sha1,
            cpu: self.cpu.clone(),
            ram: self.bus.ram.to_vec(),
            mapper: mapper.save_state(),
            apu: self.bus.apu.clone(),
        })
    }

    /// Restores a snapshot of the same program image. Nothing changes on error.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            bail!("unsupported snapshot version {}", snapshot.version);
        }
        let Some(rom_sha1) = self.rom_sha1.as_deref() else {
            bail!("no program loaded");
        };
        if snapshot.rom_sha1 != rom_sha1 {
            bail!(
                "snapshot belongs to image {}, loaded image is {rom_sha1}",
                snapshot.rom_sha1
            );
        }
        if snapshot.ram.len() != RAM_SIZE {
            bail!(
                "snapshot RAM is {} bytes, expected {RAM_SIZE}",
                snapshot.ram.len()
            );
        }

        let mapper = self.bus.mapper_mut().context("no program loaded")?;
        mapper
            .load_state(&snapshot.mapper)
            .context("failed to restore mapper state")?;

        self.cpu = snapshot.cpu.clone();
        self.bus.ram.copy_from_slice(&snapshot.ram);
        self.bus.apu = snapshot.apu.clone();
        self.bus.apu.sanitize();
        self.bus.apu.set_sample_rate(self.config.sample_rate);
        self.bus.apu.set_mixing(self.config.mixing);
        self.pending_nmi = false;
        self.halt_reported = self.cpu.halt().is_some();
        self.push_debug_event(format!("Snapshot restored, PC=${:04X}", self.cpu.pc));
        Ok(())
    }
}
