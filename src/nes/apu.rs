use serde::{Deserialize, Serialize};

pub const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const SILENCE: u8 = 128;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const MIX_CACHE_SLOTS: usize = 64;

/// Mixing law used to combine the four channel levels into one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mixing {
    #[default]
    Nonlinear,
    Linear,
}

impl Mixing {
    pub fn mix(self, levels: ChannelLevels) -> f32 {
        let p1 = levels.pulse1 as f32;
        let p2 = levels.pulse2 as f32;
        let t = levels.triangle as f32;
        let n = levels.noise as f32;

        match self {
            Self::Nonlinear => {
                let pulse_sum = p1 + p2;
                let pulse_out = if pulse_sum > 0.0 {
                    95.88 / ((8128.0 / pulse_sum) + 100.0)
                } else {
                    0.0
                };

                let tnd_in = (t / 8227.0) + (n / 12241.0);
                let tnd_out = if tnd_in > 0.0 {
                    159.79 / ((1.0 / tnd_in) + 100.0)
                } else {
                    0.0
                };

                pulse_out + tnd_out
            }
            Self::Linear => 0.00752 * (p1 + p2) + 0.00851 * t + 0.00494 * n,
        }
    }
}

/// Instantaneous 4-bit output of each channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelLevels {
    pub pulse1: u8,
    pub pulse2: u8,
    pub triangle: u8,
    pub noise: u8,
}

impl ChannelLevels {
    fn key(self) -> u16 {
        (self.pulse1 as u16 & 0x0F)
            | ((self.pulse2 as u16 & 0x0F) << 4)
            | ((self.triangle as u16 & 0x0F) << 8)
            | ((self.noise as u16 & 0x0F) << 12)
    }
}

fn to_sample(level: f32) -> u8 {
    (SILENCE as f32 + (level * 127.0).round()).clamp(SILENCE as f32, 255.0) as u8
}

/// Direct-mapped memo of recently mixed level combinations.
#[derive(Debug, Clone)]
struct MixCache {
    slots: [Option<(u16, u8)>; MIX_CACHE_SLOTS],
}

impl Default for MixCache {
    fn default() -> Self {
        Self {
            slots: [None; MIX_CACHE_SLOTS],
        }
    }
}

impl MixCache {
    fn sample(&mut self, levels: ChannelLevels, mixing: Mixing) -> u8 {
        let key = levels.key();
        let slot = ((key ^ (key >> 6) ^ (key >> 12)) as usize) % MIX_CACHE_SLOTS;
        if let Some((cached_key, sample)) = self.slots[slot] {
            if cached_key == key {
                return sample;
            }
        }
        let sample = to_sample(mixing.mix(levels));
        self.slots[slot] = Some((key, sample));
        sample
    }

    fn clear(&mut self) {
        self.slots = [None; MIX_CACHE_SLOTS];
    }
}

/// Step position of the frame sequencer. Step numbers run 1..=4 or 1..=5; 0 means just reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSequencer {
    pub five_step: bool,
    pub step: u8,
    pub irq_inhibit: bool,
    pub irq_flag: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FrameClocks {
    quarter: bool,
    half: bool,
}

impl FrameSequencer {
    fn advance(&mut self) -> FrameClocks {
        let steps = if self.five_step { 5 } else { 4 };
        self.step = self.step % steps + 1;

        let (quarter, half) = match (self.five_step, self.step) {
            (false, 2 | 4) | (true, 2 | 5) => (true, true),
            (true, 4) => (false, false),
            _ => (true, false),
        };
        if !self.five_step && self.step == 4 && !self.irq_inhibit {
            self.irq_flag = true;
        }
        FrameClocks { quarter, half }
    }

    fn write_control(&mut self, value: u8) {
        self.five_step = (value & 0x80) != 0;
        self.irq_inhibit = (value & 0x40) != 0;
        if self.irq_inhibit {
            self.irq_flag = false;
        }
        self.step = 0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    sequencer: FrameSequencer,

    cpu_cycle: u64,
    sample_rate: u32,
    cycle_debt: f64,
    mixing: Mixing,
    #[serde(skip)]
    cache: MixCache,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::default(),
            noise: NoiseChannel::new(),
            sequencer: FrameSequencer::default(),
            cpu_cycle: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            cycle_debt: 0.0,
            mixing: Mixing::default(),
            cache: MixCache::default(),
        }
    }

    /// Silences every channel. Sample rate and mixing law survive a reset.
    pub fn reset(&mut self) {
        *self = Self {
            sample_rate: self.sample_rate,
            mixing: self.mixing,
            ..Self::new()
        };
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_mixing(&mut self, mixing: Mixing) {
        if self.mixing != mixing {
            self.mixing = mixing;
            self.cache.clear();
        }
    }

    pub fn mixing(&self) -> Mixing {
        self.mixing
    }

    pub fn sequencer(&self) -> FrameSequencer {
        self.sequencer
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),

            // $4010-$4013 belong to the sample channel, which is not modelled.
            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// Length-counter bits 0-3 and frame IRQ bit 6. Reading acknowledges the frame IRQ.
    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.sequencer.irq_flag {
            status |= 0x40;
        }

        self.sequencer.irq_flag = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.sequencer.irq_flag
    }

    /// Advances the frame sequencer by one step.
    pub fn step_frame(&mut self) {
        let clocks = self.sequencer.advance();
        if clocks.quarter {
            self.clock_quarter_frame();
        }
        if clocks.half {
            self.clock_half_frame();
        }
    }

    /// Fills `buffer` with unsigned 8-bit samples, running channel timers in between.
    pub fn output(&mut self, buffer: &mut [u8]) {
        let cycles_per_sample = CPU_CLOCK_HZ / self.sample_rate as f64;
        for sample in buffer.iter_mut() {
            self.cycle_debt += cycles_per_sample;
            while self.cycle_debt >= 1.0 {
                self.cycle_debt -= 1.0;
                self.clock_timers();
            }
            *sample = self.cache.sample(self.channel_levels(), self.mixing);
        }
    }

    /// Masks register-derived fields of a deserialized APU back into their hardware widths.
    pub(crate) fn sanitize(&mut self) {
        self.pulse1.sanitize();
        self.pulse2.sanitize();
        self.triangle.sanitize();
        self.noise.sanitize();
        self.sequencer.step %= if self.sequencer.five_step { 6 } else { 5 };
        if !(0.0..1.0).contains(&self.cycle_debt) {
            self.cycle_debt = 0.0;
        }
        self.cache.clear();
    }

    pub fn channel_levels(&self) -> ChannelLevels {
        ChannelLevels {
            pulse1: self.pulse1.output(),
            pulse2: self.pulse2.output(),
            triangle: self.triangle.output(),
            noise: self.noise.output(),
        }
    }

    pub fn debug_state(&self) -> String {
        let s = &self.sequencer;
        format!(
            "APU seq_step={} five_step={} irq_inhibit={} irq={} len=[{},{},{},{}] rate={} mix={:?}",
            s.step,
            s.five_step,
            s.irq_inhibit,
            s.irq_flag,
            self.pulse1.length_counter,
            self.pulse2.length_counter,
            self.triangle.length_counter,
            self.noise.length_counter,
            self.sample_rate,
            self.mixing
        )
    }

    fn clock_timers(&mut self) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);
        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
    }

    fn write_status(&mut self, value: u8) {
        self.pulse1.set_enabled((value & 0x01) != 0);
        self.pulse2.set_enabled((value & 0x02) != 0);
        self.triangle.set_enabled((value & 0x04) != 0);
        self.noise.set_enabled((value & 0x08) != 0);
    }

    fn write_frame_counter(&mut self, value: u8) {
        self.sequencer.write_control(value);
        if self.sequencer.five_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock(self.pulse1.length_halt);
        self.pulse2.envelope.clock(self.pulse2.length_halt);
        self.triangle.clock_linear_counter();
        self.noise.envelope.clock(self.noise.length_halt);
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
        self.triangle.clock_length_counter();
        self.noise.clock_length_counter();
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Envelope {
    constant_volume: bool,
    volume: u8,
    start: bool,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
    }

    fn clock(&mut self, looping: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.volume;
            return;
        }

        if self.divider == 0 {
            self.divider = self.volume;
            if self.decay > 0 {
                self.decay -= 1;
            } else if looping {
                self.decay = 15;
            }
        } else {
            self.divider -= 1;
        }
    }

    fn sanitize(&mut self) {
        self.volume &= 0x0F;
        self.divider &= 0x0F;
        self.decay &= 0x0F;
    }

    fn level(&self) -> u8 {
        if self.constant_volume {
            self.volume
        } else {
            self.decay
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PulseChannel {
    enabled: bool,
    // Pulse 1 negates its sweep with one's complement, pulse 2 with two's complement.
    ones_complement_sweep: bool,
    duty: u8,
    duty_step: u8,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,
    length_halt: bool,
    envelope: Envelope,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    fn new(ones_complement_sweep: bool) -> Self {
        Self {
            enabled: false,
            ones_complement_sweep,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            length_halt: false,
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn sanitize(&mut self) {
        self.duty &= 0x03;
        self.duty_step &= 0x07;
        self.timer_period &= 0x07FF;
        self.timer_counter &= 0x07FF;
        self.envelope.sanitize();
        self.sweep_period = self.sweep_period.clamp(1, 8);
        self.sweep_shift &= 0x07;
        self.sweep_divider = self.sweep_divider.min(8);
    }

    fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.envelope.write(value);
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = ((value >> 4) & 0x07) + 1;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.duty_step = 0;
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_divider == 0 || self.sweep_reload {
            if self.sweep_divider == 0 && self.sweep_enabled {
                self.apply_sweep();
            }
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn apply_sweep(&mut self) {
        if self.sweep_shift == 0 || self.timer_period < 8 {
            return;
        }
        let target = self.sweep_target_period();
        if target <= 0x07FF {
            self.timer_period = target;
        }
    }

    fn sweep_target_period(&self) -> u16 {
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            let extra = u16::from(self.ones_complement_sweep);
            self.timer_period.saturating_sub(change + extra)
        } else {
            self.timer_period + change
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || DUTY_TABLE[self.duty as usize][self.duty_step as usize] == 0
            || self.timer_period < 8
            || self.sweep_target_period() > 0x07FF
        {
            return 0;
        }
        self.envelope.level()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct TriangleChannel {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload_flag: bool,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,
    seq_step: u8,
}

impl TriangleChannel {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn sanitize(&mut self) {
        self.linear_reload_value &= 0x7F;
        self.linear_counter &= 0x7F;
        self.timer_period &= 0x07FF;
        self.timer_counter &= 0x07FF;
        self.seq_step &= 0x1F;
    }

    fn write_linear(&mut self, value: u8) {
        self.control_flag = (value & 0x80) != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.linear_reload_flag = true;
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    fn clock_length_counter(&mut self) {
        if !self.control_flag && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            if self.length_counter > 0 && self.linear_counter > 0 && self.timer_period > 1 {
                self.seq_step = (self.seq_step + 1) & 0x1F;
            }
        } else {
            self.timer_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || self.linear_counter == 0
            || self.timer_period < 2
        {
            0
        } else {
            TRI_TABLE[self.seq_step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct NoiseChannel {
    enabled: bool,
    length_halt: bool,
    envelope: Envelope,

    short_mode: bool,
    timer_period: u16,
    timer_counter: u16,
    shift_register: u16,
    length_counter: u8,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            length_halt: false,
            envelope: Envelope::default(),
            short_mode: false,
            timer_period: NOISE_PERIOD_TABLE[0],
            timer_counter: 0,
            shift_register: 1,
            length_counter: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn sanitize(&mut self) {
        self.envelope.sanitize();
        if !NOISE_PERIOD_TABLE.contains(&self.timer_period) {
            self.timer_period = NOISE_PERIOD_TABLE[0];
        }
        self.timer_counter = self.timer_counter.min(self.timer_period);
        self.shift_register &= 0x7FFF;
        if self.shift_register == 0 {
            self.shift_register = 1;
        }
    }

    fn write_control(&mut self, value: u8) {
        self.length_halt = (value & 0x20) != 0;
        self.envelope.write(value);
    }

    fn write_period(&mut self, value: u8) {
        self.short_mode = (value & 0x80) != 0;
        self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.clock_shift_register();
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_shift_register(&mut self) {
        let tap = if self.short_mode { 6 } else { 1 };
        let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x0001;
        self.shift_register >>= 1;
        self.shift_register |= feedback << 14;
    }

    fn clock_length_counter(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || (self.shift_register & 0x0001) != 0 {
            return 0;
        }
        self.envelope.level()
    }
}
