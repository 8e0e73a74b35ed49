use serde::{Deserialize, Serialize};

use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;
const INTERRUPT_CYCLES: u32 = 7;

/// Base cycle count per opcode. Page crossings and taken branches add nothing.
#[rustfmt::skip]
pub const CYCLE_TABLE: [u8; 256] = [
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
];

/// Address space as seen by the interpreter.
pub trait CpuBus {
    fn read_byte(&mut self, addr: u16) -> u8;
    fn write_byte(&mut self, addr: u16, value: u8);

    fn read_word(&mut self, addr: u16) -> u16 {
        let lo = self.read_byte(addr) as u16;
        let hi = self.read_byte(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    fn write_word(&mut self, addr: u16, value: u16) {
        self.write_byte(addr, value as u8);
        self.write_byte(addr.wrapping_add(1), (value >> 8) as u8);
    }
}

/// Terminal state entered on a KIL/JAM opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    pub opcode: u8,
    pub pc: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,
    halt: Option<Halt>,
    total_cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    IndirectX,
    IndirectY,
}

// Column layout shared by the cc=01 and cc=11 opcode blocks.
const ALU_OPERANDS: [Operand; 8] = [
    Operand::IndirectX,
    Operand::ZeroPage,
    Operand::Immediate,
    Operand::Absolute,
    Operand::IndirectY,
    Operand::ZeroPageX,
    Operand::AbsoluteY,
    Operand::AbsoluteX,
];

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            halt: None,
            total_cycles: 0,
        }
    }

    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        *self = Self::new();
        self.pc = bus.read_word(RESET_VECTOR);
    }

    pub fn halt(&self) -> Option<Halt> {
        self.halt
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Executes one instruction and returns its base cycle count. A halted CPU returns 0.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.halt.is_some() {
            return 0;
        }

        let opcode = self.fetch_byte(bus);
        match opcode & 0x03 {
            0x00 => self.exec_group0(bus, opcode),
            0x01 => self.exec_group1(bus, opcode),
            0x02 => self.exec_group2(bus, opcode),
            _ => self.exec_unofficial(bus, opcode),
        }

        let cycles = CYCLE_TABLE[opcode as usize] as u32;
        self.total_cycles += cycles as u64;
        cycles
    }

    pub fn nmi<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.halt.is_some() {
            return 0;
        }
        self.interrupt(bus, NMI_VECTOR);
        INTERRUPT_CYCLES
    }

    /// Maskable request; returns 0 when the interrupt-disable flag blocks it.
    pub fn irq<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.halt.is_some() || self.get_flag(FLAG_INTERRUPT) {
            return 0;
        }
        self.interrupt(bus, IRQ_VECTOR);
        INTERRUPT_CYCLES
    }

    /// Jumps to `target` with a return address on the stack so that its `RTS` lands on `return_to`.
    pub fn prepare_call<B: CpuBus>(&mut self, bus: &mut B, target: u16, return_to: u16) {
        self.push_u16(bus, return_to.wrapping_sub(1));
        self.pc = target;
    }

    fn interrupt<B: CpuBus>(&mut self, bus: &mut B, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = bus.read_word(vector);
        self.total_cycles += INTERRUPT_CYCLES as u64;
    }

    fn enter_halt(&mut self, opcode: u8) {
        let pc = self.pc.wrapping_sub(1);
        self.halt = Some(Halt { opcode, pc });
        self.pc = pc;
    }

    pub(crate) fn set_flag(&mut self, flag: u8, enabled: bool) {
        if enabled {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub(crate) fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn fetch_byte<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let value = bus.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        bus.write_byte(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read_byte(0x0100 | self.sp as u16)
    }

    fn push_u16<B: CpuBus>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    fn read_zp_u16<B: CpuBus>(&mut self, bus: &mut B, addr: u8) -> u16 {
        let lo = bus.read_byte(addr as u16) as u16;
        let hi = bus.read_byte(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    // The high byte comes from the start of the same page when the pointer sits at $xxFF.
    fn read_u16_bug<B: CpuBus>(&mut self, bus: &mut B, addr: u16) -> u16 {
        let lo = bus.read_byte(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = bus.read_byte(hi_addr) as u16;
        (hi << 8) | lo
    }

    fn operand_addr<B: CpuBus>(&mut self, bus: &mut B, operand: Operand) -> u16 {
        match operand {
            Operand::Immediate => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                addr
            }
            Operand::ZeroPage => self.fetch_byte(bus) as u16,
            Operand::ZeroPageX => self.fetch_byte(bus).wrapping_add(self.x) as u16,
            Operand::ZeroPageY => self.fetch_byte(bus).wrapping_add(self.y) as u16,
            Operand::Absolute => self.fetch_word(bus),
            Operand::AbsoluteX | Operand::AbsoluteY | Operand::IndirectY => {
                self.indexed_with_base(bus, operand).0
            }
            Operand::IndirectX => {
                let zp = self.fetch_byte(bus).wrapping_add(self.x);
                self.read_zp_u16(bus, zp)
            }
        }
    }

    /// Effective address plus the unindexed base, for the SH* family.
    fn indexed_with_base<B: CpuBus>(&mut self, bus: &mut B, operand: Operand) -> (u16, u16) {
        let (base, index) = match operand {
            Operand::AbsoluteX => (self.fetch_word(bus), self.x),
            Operand::IndirectY => {
                let zp = self.fetch_byte(bus);
                (self.read_zp_u16(bus, zp), self.y)
            }
            _ => (self.fetch_word(bus), self.y),
        };
        (base.wrapping_add(index as u16), base)
    }

    fn read_operand<B: CpuBus>(&mut self, bus: &mut B, operand: Operand) -> u8 {
        let addr = self.operand_addr(bus, operand);
        bus.read_byte(addr)
    }

    fn exec_group0<B: CpuBus>(&mut self, bus: &mut B, opcode: u8) {
        match opcode {
            0x00 => {
                self.pc = self.pc.wrapping_add(1);
                self.push_u16(bus, self.pc);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = bus.read_word(IRQ_VECTOR);
            }
            0x08 => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            0x10 => self.branch(bus, !self.get_flag(FLAG_NEGATIVE)),
            0x18 => self.set_flag(FLAG_CARRY, false),
            0x20 => {
                let addr = self.fetch_word(bus);
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = addr;
            }
            0x24 | 0x2C => {
                let operand = if opcode == 0x24 {
                    Operand::ZeroPage
                } else {
                    Operand::Absolute
                };
                let value = self.read_operand(bus, operand);
                self.bit(value);
            }
            0x28 => self.pull_status(bus),
            0x30 => self.branch(bus, self.get_flag(FLAG_NEGATIVE)),
            0x38 => self.set_flag(FLAG_CARRY, true),
            0x40 => {
                self.pull_status(bus);
                self.pc = self.pop_u16(bus);
            }
            0x48 => self.push(bus, self.a),
            0x4C => self.pc = self.fetch_word(bus),
            0x50 => self.branch(bus, !self.get_flag(FLAG_OVERFLOW)),
            0x58 => self.set_flag(FLAG_INTERRUPT, false),
            0x60 => self.pc = self.pop_u16(bus).wrapping_add(1),
            0x68 => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            0x6C => {
                let ptr = self.fetch_word(bus);
                self.pc = self.read_u16_bug(bus, ptr);
            }
            0x70 => self.branch(bus, self.get_flag(FLAG_OVERFLOW)),
            0x78 => self.set_flag(FLAG_INTERRUPT, true),
            0x84 | 0x8C | 0x94 => {
                let operand = match opcode {
                    0x84 => Operand::ZeroPage,
                    0x8C => Operand::Absolute,
                    _ => Operand::ZeroPageX,
                };
                let addr = self.operand_addr(bus, operand);
                bus.write_byte(addr, self.y);
            }
            0x88 => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            0x90 => self.branch(bus, !self.get_flag(FLAG_CARRY)),
            0x98 => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            // SHY absolute,X
            0x9C => {
                let (addr, base) = self.indexed_with_base(bus, Operand::AbsoluteX);
                self.store_high_and(bus, addr, base, self.y);
            }
            0xA0 | 0xA4 | 0xAC | 0xB4 | 0xBC => {
                let operand = match opcode {
                    0xA0 => Operand::Immediate,
                    0xA4 => Operand::ZeroPage,
                    0xAC => Operand::Absolute,
                    0xB4 => Operand::ZeroPageX,
                    _ => Operand::AbsoluteX,
                };
                self.y = self.read_operand(bus, operand);
                self.update_zn(self.y);
            }
            0xA8 => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            0xB0 => self.branch(bus, self.get_flag(FLAG_CARRY)),
            0xB8 => self.set_flag(FLAG_OVERFLOW, false),
            0xC0 | 0xC4 | 0xCC | 0xE0 | 0xE4 | 0xEC => {
                let operand = match opcode & 0x0C {
                    0x00 => Operand::Immediate,
                    0x04 => Operand::ZeroPage,
                    _ => Operand::Absolute,
                };
                let value = self.read_operand(bus, operand);
                let register = if opcode < 0xE0 { self.y } else { self.x };
                self.compare(register, value);
            }
            0xC8 => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            0xD0 => self.branch(bus, !self.get_flag(FLAG_ZERO)),
            0xD8 => self.set_flag(FLAG_DECIMAL, false),
            0xE8 => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            0xF0 => self.branch(bus, self.get_flag(FLAG_ZERO)),
            0xF8 => self.set_flag(FLAG_DECIMAL, true),

            // Unofficial NOPs that still fetch their operand.
            0x80 => self.skip_operand(bus, Operand::Immediate),
            0x04 | 0x44 | 0x64 => self.skip_operand(bus, Operand::ZeroPage),
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => self.skip_operand(bus, Operand::ZeroPageX),
            0x0C => self.skip_operand(bus, Operand::Absolute),
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => self.skip_operand(bus, Operand::AbsoluteX),
            _ => {}
        }
    }

    fn exec_group1<B: CpuBus>(&mut self, bus: &mut B, opcode: u8) {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;
        let addr = self.operand_addr(bus, ALU_OPERANDS[bbb as usize]);

        if aaa == 4 {
            // $89 is the immediate "store": a two-byte NOP.
            if bbb != 2 {
                bus.write_byte(addr, self.a);
            }
            return;
        }

        let value = bus.read_byte(addr);
        match aaa {
            0 => self.ora(value),
            1 => self.and(value),
            2 => self.eor(value),
            3 => self.adc(value),
            5 => {
                self.a = value;
                self.update_zn(self.a);
            }
            6 => self.compare(self.a, value),
            _ => self.sbc(value),
        }
    }

    fn exec_group2<B: CpuBus>(&mut self, bus: &mut B, opcode: u8) {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;

        match (bbb, aaa) {
            (4, _) | (0, 0..=3) => self.enter_halt(opcode),
            (0, 5) => {
                self.x = self.fetch_byte(bus);
                self.update_zn(self.x);
            }
            (0, _) => self.skip_operand(bus, Operand::Immediate),
            (2, 0..=3) => self.a = self.apply_rmw(RmwOp::from_aaa(aaa), self.a),
            (2, 4) => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            (2, 5) => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            (2, 6) => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            (6, 4) => self.sp = self.x,
            (6, 5) => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            (2 | 6, _) => {}
            // SHX absolute,Y
            (7, 4) => {
                let (addr, base) = self.indexed_with_base(bus, Operand::AbsoluteY);
                self.store_high_and(bus, addr, base, self.x);
            }
            _ => {
                let uses_y = matches!(aaa, 4 | 5);
                let operand = match bbb {
                    1 => Operand::ZeroPage,
                    3 => Operand::Absolute,
                    5 if uses_y => Operand::ZeroPageY,
                    5 => Operand::ZeroPageX,
                    _ if uses_y => Operand::AbsoluteY,
                    _ => Operand::AbsoluteX,
                };
                let addr = self.operand_addr(bus, operand);
                match aaa {
                    4 => bus.write_byte(addr, self.x),
                    5 => {
                        self.x = bus.read_byte(addr);
                        self.update_zn(self.x);
                    }
                    _ => {
                        let value = bus.read_byte(addr);
                        let out = self.apply_rmw(RmwOp::from_aaa(aaa), value);
                        bus.write_byte(addr, out);
                    }
                }
            }
        }
    }

    fn exec_unofficial<B: CpuBus>(&mut self, bus: &mut B, opcode: u8) {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;

        match opcode {
            // SHA (indirect),Y and absolute,Y
            0x93 | 0x9F => {
                let operand = if opcode == 0x93 {
                    Operand::IndirectY
                } else {
                    Operand::AbsoluteY
                };
                let (addr, base) = self.indexed_with_base(bus, operand);
                self.store_high_and(bus, addr, base, self.a & self.x);
                return;
            }
            // TAS absolute,Y
            0x9B => {
                let (addr, base) = self.indexed_with_base(bus, Operand::AbsoluteY);
                self.sp = self.a & self.x;
                self.store_high_and(bus, addr, base, self.sp);
                return;
            }
            // LAS absolute,Y
            0xBB => {
                let value = self.read_operand(bus, Operand::AbsoluteY) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
                return;
            }
            _ => {}
        }

        if bbb == 2 {
            let imm = self.fetch_byte(bus);
            self.exec_unofficial_immediate(aaa, imm);
            return;
        }

        let operand = match (aaa, bbb) {
            (4 | 5, 5) => Operand::ZeroPageY,
            (4 | 5, 7) => Operand::AbsoluteY,
            _ => ALU_OPERANDS[bbb as usize],
        };
        let addr = self.operand_addr(bus, operand);

        match aaa {
            // SAX
            4 => bus.write_byte(addr, self.a & self.x),
            // LAX
            5 => {
                let value = bus.read_byte(addr);
                self.a = value;
                self.x = value;
                self.update_zn(value);
            }
            _ => self.exec_unofficial_rmw(bus, addr, UnofficialRmwOp::from_aaa(aaa)),
        }
    }

    fn exec_unofficial_immediate(&mut self, aaa: u8, imm: u8) {
        match aaa {
            // ANC
            0 | 1 => {
                self.a &= imm;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x80) != 0);
            }
            // ALR
            2 => {
                self.a &= imm;
                self.a = self.lsr(self.a);
            }
            // ARR
            3 => {
                self.a &= imm;
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.a = (self.a >> 1) | carry_in;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                self.set_flag(
                    FLAG_OVERFLOW,
                    (((self.a >> 6) & 0x01) ^ ((self.a >> 5) & 0x01)) != 0,
                );
            }
            // XAA, unstable on hardware; the common "magic $EE" form.
            4 => {
                self.a = (self.a | 0xEE) & self.x & imm;
                self.update_zn(self.a);
            }
            // LXA
            5 => {
                self.a = (self.a | 0xEE) & imm;
                self.x = self.a;
                self.update_zn(self.a);
            }
            // AXS
            6 => {
                let in_ax = self.a & self.x;
                self.set_flag(FLAG_CARRY, in_ax >= imm);
                self.x = in_ax.wrapping_sub(imm);
                self.update_zn(self.x);
            }
            _ => self.sbc(imm),
        }
    }

    fn exec_unofficial_rmw<B: CpuBus>(&mut self, bus: &mut B, addr: u16, op: UnofficialRmwOp) {
        let value = bus.read_byte(addr);
        let out = match op {
            UnofficialRmwOp::Slo => {
                let shifted = self.asl(value);
                self.ora(shifted);
                shifted
            }
            UnofficialRmwOp::Rla => {
                let shifted = self.rol(value);
                self.and(shifted);
                shifted
            }
            UnofficialRmwOp::Sre => {
                let shifted = self.lsr(value);
                self.eor(shifted);
                shifted
            }
            UnofficialRmwOp::Rra => {
                let shifted = self.ror(value);
                self.adc(shifted);
                shifted
            }
            UnofficialRmwOp::Dcp => {
                let decremented = value.wrapping_sub(1);
                self.compare(self.a, decremented);
                decremented
            }
            UnofficialRmwOp::Isc => {
                let incremented = value.wrapping_add(1);
                self.sbc(incremented);
                incremented
            }
        };
        bus.write_byte(addr, out);
    }

    // SHA/SHX/SHY/TAS store `value & (base_hi + 1)`; a page crossing replaces the target high byte.
    fn store_high_and<B: CpuBus>(&mut self, bus: &mut B, addr: u16, base: u16, value: u8) {
        let h = ((base >> 8) as u8).wrapping_add(1);
        let out = value & h;
        let crossed = (base & 0xFF00) != (addr & 0xFF00);
        let write_addr = if crossed {
            ((out as u16) << 8) | (addr & 0x00FF)
        } else {
            addr
        };
        bus.write_byte(write_addr, out);
    }

    fn skip_operand<B: CpuBus>(&mut self, bus: &mut B, operand: Operand) {
        let _ = self.read_operand(bus, operand);
    }

    fn pull_status<B: CpuBus>(&mut self, bus: &mut B) {
        self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
    }

    fn branch<B: CpuBus>(&mut self, bus: &mut B, condition: bool) {
        let offset = self.fetch_byte(bus) as i8;
        if condition {
            self.pc = self.pc.wrapping_add(offset as i16 as u16);
        }
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
            RmwOp::Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
        }
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    // Binary only: the decimal flag has no effect on this CPU.
    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.get_flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.get_flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}

impl RmwOp {
    fn from_aaa(aaa: u8) -> Self {
        match aaa {
            0 => Self::Asl,
            1 => Self::Rol,
            2 => Self::Lsr,
            3 => Self::Ror,
            6 => Self::Dec,
            _ => Self::Inc,
        }
    }
}

#[derive(Clone, Copy)]
enum UnofficialRmwOp {
    Slo,
    Rla,
    Sre,
    Rra,
    Dcp,
    Isc,
}

impl UnofficialRmwOp {
    fn from_aaa(aaa: u8) -> Self {
        match aaa {
            0 => Self::Slo,
            1 => Self::Rla,
            2 => Self::Sre,
            3 => Self::Rra,
            6 => Self::Dcp,
            _ => Self::Isc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBus {
        mem: Vec<u8>,
    }

    impl TestBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x1_0000],
            }
        }

        fn load(&mut self, addr: u16, bytes: &[u8]) {
            let start = addr as usize;
            self.mem[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl CpuBus for TestBus {
        fn read_byte(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write_byte(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }
    }

    fn boot(program: &[u8]) -> (Cpu, TestBus) {
        let mut bus = TestBus::new();
        bus.load(0x8000, program);
        bus.write_word(RESET_VECTOR, 0x8000);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    fn run(cpu: &mut Cpu, bus: &mut TestBus, instructions: usize) -> u32 {
        (0..instructions).map(|_| cpu.step(bus)).sum()
    }

    #[test]
    fn reset_applies_power_on_pattern() {
        let (cpu, _) = boot(&[0xEA]);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.sp, 0xFD);
        assert_eq!(cpu.p, FLAG_INTERRUPT | FLAG_UNUSED);
        assert_eq!((cpu.a, cpu.x, cpu.y), (0, 0, 0));
        assert_eq!(cpu.halt(), None);
    }

    #[test]
    fn adc_sets_carry_and_overflow() {
        // LDA #$50; ADC #$50
        let (mut cpu, mut bus) = boot(&[0xA9, 0x50, 0x69, 0x50]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_NEGATIVE));
        assert!(!cpu.get_flag(FLAG_CARRY));

        // LDA #$FF; ADC #$01
        let (mut cpu, mut bus) = boot(&[0xA9, 0xFF, 0x69, 0x01]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_ZERO));
        assert!(!cpu.get_flag(FLAG_OVERFLOW));
    }

    #[test]
    fn sbc_borrows_through_carry() {
        // SEC; LDA #$00; SBC #$01
        let (mut cpu, mut bus) = boot(&[0x38, 0xA9, 0x00, 0xE9, 0x01]);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0xFF);
        assert!(!cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_NEGATIVE));

        // SEC; LDA #$80; SBC #$01 overflows into positive.
        let (mut cpu, mut bus) = boot(&[0x38, 0xA9, 0x80, 0xE9, 0x01]);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0x7F);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_CARRY));
    }

    #[test]
    fn decimal_flag_does_not_change_adc() {
        // SED; CLC; LDA #$09; ADC #$01
        let (mut cpu, mut bus) = boot(&[0xF8, 0x18, 0xA9, 0x09, 0x69, 0x01]);
        run(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.a, 0x0A);
        assert!(cpu.get_flag(FLAG_DECIMAL));
    }

    #[test]
    fn alu_flags_do_not_depend_on_addressing_mode() {
        let cases = [
            (0x50u8, 0x50u8, false),
            (0xFF, 0x01, true),
            (0x7F, 0x80, false),
            (0x00, 0x00, true),
            (0x80, 0xFF, false),
        ];
        // ADC, CMP and SBC in immediate/zp/abs/abs,X/(ind),Y forms.
        let families: [[u8; 5]; 3] = [
            [0x69, 0x65, 0x6D, 0x7D, 0x71],
            [0xC9, 0xC5, 0xCD, 0xDD, 0xD1],
            [0xE9, 0xE5, 0xED, 0xFD, 0xF1],
        ];

        for family in families {
            for &(a, value, carry) in &cases {
                let mut outcomes = Vec::new();
                for (form, opcode) in family.into_iter().enumerate() {
                    let operand: &[u8] = match form {
                        0 => &[value],
                        1 => &[0x10],
                        2 => &[0x00, 0x02],
                        3 => &[0xFC, 0x01],
                        _ => &[0x20],
                    };
                    let carry_op = if carry { 0x38 } else { 0x18 };
                    let mut program = vec![carry_op, 0xA9, a, 0xA2, 0x04, 0xA0, 0x04, opcode];
                    program.extend_from_slice(operand);
                    let (mut cpu, mut bus) = boot(&program);
                    bus.mem[0x0010] = value;
                    bus.mem[0x0200] = value;
                    bus.mem[0x0020] = 0xFC;
                    bus.mem[0x0021] = 0x01;
                    run(&mut cpu, &mut bus, 5);
                    outcomes.push((cpu.a, cpu.p));
                }
                assert!(
                    outcomes.windows(2).all(|w| w[0] == w[1]),
                    "opcode family {family:02X?} a={a:02X} v={value:02X}: {outcomes:?}"
                );
            }
        }
    }

    #[test]
    fn compare_sets_carry_and_zero() {
        // LDA #$40; CMP #$40
        let (mut cpu, mut bus) = boot(&[0xA9, 0x40, 0xC9, 0x40]);
        run(&mut cpu, &mut bus, 2);
        assert!(cpu.get_flag(FLAG_ZERO));
        assert!(cpu.get_flag(FLAG_CARRY));

        let (mut cpu, mut bus) = boot(&[0xE0, 0x01]);
        run(&mut cpu, &mut bus, 1);
        assert!(!cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn stack_pointer_wraps_silently() {
        // LDX #$00; TXS; LDA #$5A; PHA; PLA
        let (mut cpu, mut bus) = boot(&[0xA2, 0x00, 0x9A, 0xA9, 0x5A, 0x48, 0x68]);
        run(&mut cpu, &mut bus, 4);
        assert_eq!(bus.mem[0x0100], 0x5A);
        assert_eq!(cpu.sp, 0xFF);
        cpu.a = 0;
        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.a, 0x5A);
        assert_eq!(cpu.sp, 0x00);
    }

    #[test]
    fn jsr_and_rts_round_trip() {
        let (mut cpu, mut bus) = boot(&[0x20, 0x00, 0x90, 0xEA]);
        bus.load(0x9000, &[0x60]);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0xFD);
    }

    #[test]
    fn brk_pushes_break_and_rti_clears_it() {
        let (mut cpu, mut bus) = boot(&[0x00, 0xFF, 0xEA]);
        bus.write_word(IRQ_VECTOR, 0x9000);
        bus.load(0x9000, &[0x40]);

        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc, 0x9000);
        let pushed = bus.mem[0x01FB];
        assert_eq!(pushed & (FLAG_BREAK | FLAG_UNUSED), FLAG_BREAK | FLAG_UNUSED);
        assert!(cpu.get_flag(FLAG_INTERRUPT));

        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(cpu.p & FLAG_BREAK, 0);
        assert_ne!(cpu.p & FLAG_UNUSED, 0);
    }

    #[test]
    fn php_sets_break_and_plp_drops_it() {
        // PHP; LDA #$FF; PHA; PLP
        let (mut cpu, mut bus) = boot(&[0x08, 0xA9, 0xFF, 0x48, 0x28]);
        run(&mut cpu, &mut bus, 1);
        assert_eq!(bus.mem[0x01FD], FLAG_INTERRUPT | FLAG_UNUSED | FLAG_BREAK);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.p, 0xFF & !FLAG_BREAK);
    }

    #[test]
    fn jmp_indirect_wraps_within_page() {
        let (mut cpu, mut bus) = boot(&[0x6C, 0xFF, 0x10]);
        bus.mem[0x10FF] = 0x34;
        bus.mem[0x1000] = 0x12;
        bus.mem[0x1100] = 0x56;
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn branches_use_base_cycles_only() {
        // LDX #$01; BNE +2 (taken); LDA $80FF,X crosses a page.
        let (mut cpu, mut bus) = boot(&[0xA2, 0x01, 0xD0, 0x02, 0xEA, 0xEA, 0xBD, 0xFF, 0x80]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.pc, 0x8006);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.total_cycles(), 8);
    }

    #[test]
    fn kil_halts_and_stays_halted() {
        let (mut cpu, mut bus) = boot(&[0xEA, 0x92, 0xEA]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(
            cpu.halt(),
            Some(Halt {
                opcode: 0x92,
                pc: 0x8001
            })
        );
        assert_eq!(cpu.step(&mut bus), 0);
        assert_eq!(cpu.pc, 0x8001);
        assert_eq!(cpu.nmi(&mut bus), 0);

        cpu.reset(&mut bus);
        assert_eq!(cpu.halt(), None);
    }

    #[test]
    fn every_kil_opcode_halts() {
        for opcode in [
            0x02, 0x12, 0x22, 0x32, 0x42, 0x52, 0x62, 0x72, 0x92, 0xB2, 0xD2, 0xF2,
        ] {
            let (mut cpu, mut bus) = boot(&[opcode]);
            cpu.step(&mut bus);
            assert_eq!(cpu.halt().map(|h| h.opcode), Some(opcode));
        }
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        let (mut cpu, mut bus) = boot(&[0x58, 0xEA]);
        bus.write_word(IRQ_VECTOR, 0x9000);
        assert_eq!(cpu.irq(&mut bus), 0);
        assert_eq!(cpu.pc, 0x8000);

        cpu.step(&mut bus);
        assert_eq!(cpu.irq(&mut bus), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(bus.mem[0x01FB] & FLAG_BREAK, 0);
        assert!(cpu.get_flag(FLAG_INTERRUPT));
    }

    #[test]
    fn nmi_ignores_interrupt_disable() {
        let (mut cpu, mut bus) = boot(&[0xEA]);
        bus.write_word(NMI_VECTOR, 0xA000);
        assert_eq!(cpu.nmi(&mut bus), 7);
        assert_eq!(cpu.pc, 0xA000);
        assert_eq!(bus.read_word(0x01FC), 0x8000);
    }

    #[test]
    fn unofficial_load_store_combos() {
        // LAX $10; SAX $11 with X reloaded
        let (mut cpu, mut bus) = boot(&[0xA7, 0x10, 0xA2, 0x0F, 0x87, 0x11]);
        bus.mem[0x0010] = 0x3C;
        run(&mut cpu, &mut bus, 1);
        assert_eq!((cpu.a, cpu.x), (0x3C, 0x3C));
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0011], 0x0C);
    }

    #[test]
    fn unofficial_read_modify_write_ops() {
        // LDA #$01; SLO $10 -> mem $80, A = $81
        let (mut cpu, mut bus) = boot(&[0xA9, 0x01, 0x07, 0x10]);
        bus.mem[0x0010] = 0x40;
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0010], 0x80);
        assert_eq!(cpu.a, 0x81);

        // LDA #$05; DCP $10 -> mem $05, equal
        let (mut cpu, mut bus) = boot(&[0xA9, 0x05, 0xC7, 0x10]);
        bus.mem[0x0010] = 0x06;
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0010], 0x05);
        assert!(cpu.get_flag(FLAG_ZERO));
        assert!(cpu.get_flag(FLAG_CARRY));

        // SEC; LDA #$10; ISC $10 -> mem $10, A = 0
        let (mut cpu, mut bus) = boot(&[0x38, 0xA9, 0x10, 0xE7, 0x10]);
        bus.mem[0x0010] = 0x0F;
        run(&mut cpu, &mut bus, 3);
        assert_eq!(bus.mem[0x0010], 0x10);
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.get_flag(FLAG_CARRY));

        // LDA #$FF; SRE $10 -> mem $01, A = $FE, C set
        let (mut cpu, mut bus) = boot(&[0xA9, 0xFF, 0x47, 0x10]);
        bus.mem[0x0010] = 0x03;
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0010], 0x01);
        assert_eq!(cpu.a, 0xFE);
        assert!(cpu.get_flag(FLAG_CARRY));
    }

    #[test]
    fn unofficial_immediates() {
        // LDA #$FF; ANC #$80
        let (mut cpu, mut bus) = boot(&[0xA9, 0xFF, 0x0B, 0x80]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_CARRY));

        // LDA #$FF; ALR #$03
        let (mut cpu, mut bus) = boot(&[0xA9, 0xFF, 0x4B, 0x03]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.a, 0x01);
        assert!(cpu.get_flag(FLAG_CARRY));

        // SEC; LDA #$FF; ARR #$FF -> $FF, C and V from bits 6/5
        let (mut cpu, mut bus) = boot(&[0x38, 0xA9, 0xFF, 0x6B, 0xFF]);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0xFF);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(!cpu.get_flag(FLAG_OVERFLOW));

        // LDA #$0F; LDX #$07; AXS #$02 -> X = 5
        let (mut cpu, mut bus) = boot(&[0xA9, 0x0F, 0xA2, 0x07, 0xCB, 0x02]);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.x, 0x05);
        assert!(cpu.get_flag(FLAG_CARRY));

        // LXA #$31 with A = 0 -> A = X = $20
        let (mut cpu, mut bus) = boot(&[0xAB, 0x31]);
        run(&mut cpu, &mut bus, 1);
        assert_eq!((cpu.a, cpu.x), (0x20, 0x20));
    }

    #[test]
    fn las_and_tas_share_the_stack_pointer() {
        // LAS $0200,Y
        let (mut cpu, mut bus) = boot(&[0xBB, 0x00, 0x02]);
        bus.mem[0x0200] = 0xF0;
        run(&mut cpu, &mut bus, 1);
        assert_eq!((cpu.a, cpu.x, cpu.sp), (0xF0, 0xF0, 0xF0));

        // LDA #$FF; LDX #$0F; TAS $0200,Y -> SP = $0F, mem = $0F & $03
        let (mut cpu, mut bus) = boot(&[0xA9, 0xFF, 0xA2, 0x0F, 0x9B, 0x00, 0x02]);
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.sp, 0x0F);
        assert_eq!(bus.mem[0x0200], 0x03);
    }

    #[test]
    fn shx_and_shy_mask_with_high_byte() {
        // LDX #$FF; SHX $0300,Y (Y = 0)
        let (mut cpu, mut bus) = boot(&[0xA2, 0xFF, 0x9E, 0x00, 0x03]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0300], 0x04);

        // LDY #$FF; SHY $0300,X (X = 0)
        let (mut cpu, mut bus) = boot(&[0xA0, 0xFF, 0x9C, 0x00, 0x03]);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0300], 0x04);
    }

    #[test]
    fn unofficial_nops_consume_operands() {
        let program = [
            0x1A, // NOP
            0x80, 0xFF, // NOP #imm
            0x04, 0x10, // NOP zp
            0x14, 0x10, // NOP zp,X
            0x0C, 0x00, 0x02, // NOP abs
            0x1C, 0x00, 0x02, // NOP abs,X
            0x89, 0x00, // NOP #imm via the STA column
            0xE2, 0x00, // NOP #imm
        ];
        let (mut cpu, mut bus) = boot(&program);
        let before = cpu.clone();
        let cycles = run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.pc, 0x8000 + program.len() as u16);
        assert_eq!((cpu.a, cpu.x, cpu.y, cpu.p, cpu.sp), (before.a, before.x, before.y, before.p, before.sp));
        assert_eq!(cycles, 2 + 2 + 3 + 4 + 4 + 4 + 2 + 2);
        assert!(bus.mem[..0x0800].iter().all(|&b| b == 0));
    }

    #[test]
    fn indexed_addressing_wraps_zero_page() {
        // LDX #$FF; LDA $80,X reads $7F; LDY #$02; LDX $FF,Y reads $01
        let (mut cpu, mut bus) = boot(&[0xA2, 0xFF, 0xB5, 0x80, 0xA0, 0x02, 0xB6, 0xFF]);
        bus.mem[0x007F] = 0x11;
        bus.mem[0x0001] = 0x22;
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.a, 0x11);
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.x, 0x22);
    }

    #[test]
    fn read_modify_write_on_accumulator_and_memory() {
        // SEC; LDA #$81; ROR A -> $C0, C set; INC $10; ASL $10
        let (mut cpu, mut bus) = boot(&[0x38, 0xA9, 0x81, 0x6A, 0xE6, 0x10, 0x06, 0x10]);
        bus.mem[0x0010] = 0x7F;
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0xC0);
        assert!(cpu.get_flag(FLAG_CARRY));
        run(&mut cpu, &mut bus, 2);
        assert_eq!(bus.mem[0x0010], 0x00);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_ZERO));
    }

    #[test]
    fn prepare_call_returns_to_sentinel() {
        let (mut cpu, mut bus) = boot(&[0x60]);
        cpu.prepare_call(&mut bus, 0x8000, 0x4100);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x4100);
    }
}
