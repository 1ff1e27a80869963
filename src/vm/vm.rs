//! Main virtual machine implementation
//!
//! `VirtualMachine` owns the registers, both stacks, both address spaces and
//! the host side of the built-ins, and drives the fetch-decode-execute loop.
//! Each instruction computes at most one pending next program counter; when it
//! computes none the counter advances by one word.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, trace};

use crate::bytecode::{Builtin, Opcode, REGISTER_COUNT};
use crate::types::{Address, AddressSpace, OneStep, Register};
use crate::vm::errors::VMError;
use crate::vm::execution::{BuiltinExecution, BuiltinOutcome, HostStreams};
use crate::vm::memory::Memory;
use crate::vm::stack::{CalculationStack, CallStack};
use crate::vm::types::{Limits, NoopObserver, Observer, Termination};

/// Result of executing one instruction
enum Flow {
    Continue(Option<Address>),
    Exit(i32),
}

/// The register virtual machine
pub struct VirtualMachine {
    registers: [Register; REGISTER_COUNT],
    program_counter: Address,
    stack: CalculationStack,
    calls: CallStack,
    memory: Memory,
    builtins: BuiltinExecution,
    observer: Box<dyn Observer>,
    limits: Limits,
}

impl VirtualMachine {
    /// Create a VM whose static data is `static_data`, loaded at offset 0
    pub fn new(static_data: &[u8]) -> Self {
        let limits = Limits::default();
        Self::with_memory(Memory::from_literal_data(static_data, limits.heap_base), limits)
    }

    /// Create a VM from an explicit offset to byte map of static data
    pub fn from_static_map(static_data: BTreeMap<u64, u8>) -> Self {
        let limits = Limits::default();
        Self::with_memory(Memory::new(static_data, limits.heap_base), limits)
    }

    fn with_memory(memory: Memory, limits: Limits) -> Self {
        Self {
            registers: [Register::default(); REGISTER_COUNT],
            program_counter: Address::default(),
            stack: CalculationStack::new(limits.max_stack_bytes),
            calls: CallStack::new(limits.max_call_depth),
            memory,
            builtins: BuiltinExecution::new(HostStreams::inherit()),
            observer: Box::new(NoopObserver),
            limits,
        }
    }

    /// Replace the host streams behind descriptors 0, 1 and 2
    pub fn with_streams(mut self, streams: HostStreams) -> Self {
        self.builtins = BuiltinExecution::new(streams);
        self
    }

    /// Apply resource limits. Clears both stacks.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.stack = CalculationStack::new(limits.max_stack_bytes);
        self.calls = CallStack::new(limits.max_call_depth);
        self.memory.set_heap_base(limits.heap_base);
        self.memory.set_heap_limit(limits.max_heap_bytes);
        self.limits = limits;
        self
    }

    pub fn install_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = observer;
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn program_counter(&self) -> Address {
        self.program_counter
    }

    pub fn registers(&self) -> &[Register; REGISTER_COUNT] {
        &self.registers
    }

    /// Register `index`. Panics if `index` is not below 16.
    pub fn register(&self, index: usize) -> Register {
        self.registers[index]
    }

    pub fn set_register(&mut self, index: usize, value: Register) {
        self.registers[index] = value;
    }

    pub fn calculation_stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn call_stack_depth(&self) -> usize {
        self.calls.depth()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Run `code` from `entry` until the end of the code, EXIT, or a fault.
    pub fn execute(&mut self, code: &[OneStep], entry: Address) -> Result<Termination, VMError> {
        debug!("executing {} words from {}", code.len(), entry);
        self.program_counter = entry;
        loop {
            let address = self.program_counter;
            let index = self.fetch_index(address, code.len())?;
            if index == code.len() {
                debug!("reached end of code");
                return Ok(Termination::EndOfCode);
            }

            let step = code[index];
            self.observer.before_step(address, step);

            match self.step(address, step)? {
                Flow::Continue(next) => {
                    self.program_counter = next.unwrap_or(address + 1);
                    self.observer.program_counter_updated(self.program_counter);
                }
                Flow::Exit(status) => {
                    debug!("program exited with status {}", status);
                    return Ok(Termination::Exit(status));
                }
            }
        }
    }

    /// Index of `address` in the code, which may be one past the last word.
    fn fetch_index(&self, address: Address, code_len: usize) -> Result<usize, VMError> {
        let out_of_range = VMError::ProgramCounterOutOfRange {
            address: address.value(),
            code_len,
        };
        if address.space() == AddressSpace::Static {
            return Err(out_of_range);
        }
        match usize::try_from(address.value()) {
            Ok(index) if index <= code_len => Ok(index),
            _ => Err(out_of_range),
        }
    }

    fn step(&mut self, address: Address, step: OneStep) -> Result<Flow, VMError> {
        let opcode = step.opcode().ok_or(VMError::UnknownOpcode {
            address: address.value(),
            opcode: step.opcode_byte(),
        })?;
        let (a, b) = step.operands();
        let (x, y) = (self.registers[a], self.registers[b]);
        trace!("{} {} r{}={} r{}={}", address, opcode, a, x, b, y);

        let r = &mut self.registers;
        let mut next = None;
        match opcode {
            Opcode::Nop => {}
            Opcode::Mov => r[a] = y,
            Opcode::And => r[a] = x & y,
            Opcode::Or => r[a] = x | y,
            Opcode::Xor => r[a] = x ^ y,
            Opcode::Not => r[a] = !x,
            Opcode::Add => r[a] = x + y,
            Opcode::Sub => r[a] = x - y,
            Opcode::Mul => r[a] = x * y,
            Opcode::Div | Opcode::Mod => {
                if y.value() == 0 {
                    return Err(VMError::DivisionByZero {
                        address: address.value(),
                    });
                }
                r[a] = if opcode == Opcode::Div {
                    x / y
                } else {
                    x % y
                };
            }
            Opcode::DAdd => r[a] = Register::from_f64(x.as_f64() + y.as_f64()),
            Opcode::DSub => r[a] = Register::from_f64(x.as_f64() - y.as_f64()),
            Opcode::DMul => r[a] = Register::from_f64(x.as_f64() * y.as_f64()),
            Opcode::DDiv => r[a] = Register::from_f64(x.as_f64() / y.as_f64()),
            Opcode::DMod => r[a] = Register::from_f64(x.as_f64() % y.as_f64()),
            Opcode::PushR8 | Opcode::PushR16 | Opcode::PushR32 | Opcode::PushR64 => {
                let width = opcode.width().unwrap_or(8);
                self.stack.push_register(x, width)?;
            }
            Opcode::PushL => self.stack.push_byte(step.literal())?,
            Opcode::Pop8 | Opcode::Pop16 | Opcode::Pop32 | Opcode::Pop64 => {
                let width = opcode.width().unwrap_or(8);
                let value = self.stack.pop_width(width)?;
                r[a] = merge_low(x, value, width);
            }
            Opcode::Store8 | Opcode::Store16 | Opcode::Store32 | Opcode::Store64 => {
                let width = opcode.width().unwrap_or(8);
                self.memory
                    .write_width(Address::from(x), y.value(), width)?;
            }
            Opcode::Load8 | Opcode::Load16 | Opcode::Load32 | Opcode::Load64 => {
                let width = opcode.width().unwrap_or(8);
                let value = self.memory.read_width(Address::from(y), width)?;
                r[a] = merge_low(x, value, width);
            }
            Opcode::LShift => r[a] = x << shift_amount(y),
            Opcode::RShift => r[a] = x >> shift_amount(y),
            Opcode::IfZ => {
                if x.as_i64() == 0 {
                    next = Some(Address::from(y));
                }
            }
            Opcode::IfP => {
                if x.as_i64() > 0 {
                    next = Some(Address::from(y));
                }
            }
            Opcode::IfN => {
                if x.as_i64() < 0 {
                    next = Some(Address::from(y));
                }
            }
            Opcode::Goto => next = Some(Address::from(x)),
            Opcode::Call => {
                let target = Address::from(x);
                if target.space() == AddressSpace::Static {
                    return self.call_builtin(address, target.offset());
                }
                self.calls.push(address)?;
                next = Some(target);
            }
            Opcode::Ret => {
                let caller = self.calls.pop(address)?;
                next = Some(caller + 1);
            }
        }
        Ok(Flow::Continue(next))
    }

    fn call_builtin(&mut self, address: Address, id: u64) -> Result<Flow, VMError> {
        let builtin = Builtin::try_from(id).map_err(|_| VMError::UnknownBuiltin {
            address: address.value(),
            id,
        })?;
        trace!("{} calling built-in {}", address, builtin);
        match self
            .builtins
            .call(builtin, &mut self.stack, &mut self.memory)?
        {
            BuiltinOutcome::Continue => Ok(Flow::Continue(None)),
            BuiltinOutcome::Exit(status) => Ok(Flow::Exit(status)),
        }
    }
}

/// Replace the low `width` bytes of `register` with `value`
fn merge_low(register: Register, value: u64, width: usize) -> Register {
    if width >= 8 {
        return Register(value);
    }
    let mask = (1u64 << (width * 8)) - 1;
    Register((register.value() & !mask) | (value & mask))
}

/// Amounts of 64 and above shift everything out
fn shift_amount(register: Register) -> u32 {
    u32::try_from(register.value()).unwrap_or(u32::MAX)
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, register) in self.registers.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "r{}:{}", i, register)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;
    use crate::vm::execution::SharedBuffer;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    /// Records every address handed to `before_step`
    #[derive(Clone, Default)]
    struct StepRecorder(Rc<RefCell<Vec<u64>>>);

    impl Observer for StepRecorder {
        fn before_step(&mut self, address: Address, _step: OneStep) {
            self.0.borrow_mut().push(address.value());
        }
    }

    fn op(opcode: Opcode, a: u8, b: u8) -> OneStep {
        OneStep::encode(opcode, a, b)
    }

    fn quiet_vm(static_data: &[u8]) -> (VirtualMachine, SharedBuffer) {
        let out = SharedBuffer::new();
        let vm = VirtualMachine::new(static_data).with_streams(HostStreams::new(
            Box::new(io::empty()),
            Box::new(out.clone()),
            Box::new(io::sink()),
        ));
        (vm, out)
    }

    #[test]
    fn test_writes_hi_to_stdout() {
        let mut code = CodeBuilder::new();
        code.push_literal(b'h')
            .push_literal(b'i')
            .push_u64(2)
            .push_u64(Address::static_data(0).value())
            .push_u64(1)
            .call_builtin(15, Builtin::Write);
        let code = code.finish();

        let (mut vm, out) = quiet_vm(b"hi\0");
        assert_eq!(vm.execute(&code, Address(0)), Ok(Termination::EndOfCode));
        assert_eq!(out.contents(), b"hi");
        // The two literal bytes are still on the stack.
        assert_eq!(vm.calculation_stack_depth(), 2);
    }

    #[test]
    fn test_push_pop_width_symmetry() {
        let source = Register(0x1122_3344_5566_7788);
        let pairs = [
            (Opcode::PushR8, Opcode::Pop8, 0xFFu64),
            (Opcode::PushR16, Opcode::Pop16, 0xFFFF),
            (Opcode::PushR32, Opcode::Pop32, 0xFFFF_FFFF),
            (Opcode::PushR64, Opcode::Pop64, u64::MAX),
        ];
        for (push, pop, mask) in pairs {
            let (mut vm, _) = quiet_vm(&[]);
            vm.set_register(1, source);
            vm.set_register(2, Register(0xAAAA_AAAA_AAAA_AAAA));
            let code = [op(push, 1, 0), op(pop, 2, 0)];
            vm.execute(&code, Address(0)).unwrap();

            let result = vm.register(2).value();
            assert_eq!(result & mask, source.value() & mask);
            assert_eq!(result & !mask, 0xAAAA_AAAA_AAAA_AAAA & !mask);
            assert_eq!(vm.calculation_stack_depth(), 0);
        }
    }

    #[test]
    fn test_call_returns_after_call_site() {
        let code = [
            op(Opcode::Nop, 0, 0),
            op(Opcode::Nop, 0, 0),
            op(Opcode::Nop, 0, 0),
            op(Opcode::Nop, 0, 0),
            op(Opcode::Nop, 0, 0),
            op(Opcode::Call, 1, 0),
            op(Opcode::Goto, 2, 0),
            op(Opcode::Ret, 0, 0),
        ];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(1, Register(7));
        vm.set_register(2, Register(8));
        let recorder = StepRecorder::default();
        vm.install_observer(Box::new(recorder.clone()));

        assert_eq!(vm.execute(&code, Address(0)), Ok(Termination::EndOfCode));
        assert_eq!(*recorder.0.borrow(), vec![0, 1, 2, 3, 4, 5, 7, 6]);
        assert_eq!(vm.call_stack_depth(), 0);
    }

    #[test]
    fn test_conditional_branches() {
        // r0 = 0, r1 = -1, r2 = 1, r3 = skip target, r4 = marker
        let code = [
            op(Opcode::IfZ, 0, 3),
            op(Opcode::Not, 4, 0),
            op(Opcode::IfP, 1, 5),
            op(Opcode::IfN, 1, 6),
            op(Opcode::Not, 4, 0),
            op(Opcode::Nop, 0, 0),
        ];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(1, Register(u64::MAX));
        vm.set_register(3, Register(2));
        vm.set_register(5, Register(4));
        vm.set_register(6, Register(5));
        let recorder = StepRecorder::default();
        vm.install_observer(Box::new(recorder.clone()));

        vm.execute(&code, Address(0)).unwrap();
        assert_eq!(*recorder.0.borrow(), vec![0, 2, 3, 5]);
        assert_eq!(vm.register(4), Register(0));
    }

    #[test]
    fn test_arithmetic() {
        let code = [
            op(Opcode::Add, 0, 1),
            op(Opcode::Sub, 2, 1),
            op(Opcode::Mul, 3, 1),
            op(Opcode::Div, 4, 1),
            op(Opcode::Mod, 5, 1),
            op(Opcode::LShift, 6, 7),
            op(Opcode::RShift, 8, 9),
        ];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(0, Register(u64::MAX));
        vm.set_register(1, Register(3));
        vm.set_register(3, Register(5));
        vm.set_register(4, Register(10));
        vm.set_register(5, Register(10));
        vm.set_register(6, Register(1));
        vm.set_register(7, Register(4));
        vm.set_register(8, Register(u64::MAX));
        vm.set_register(9, Register(64));

        vm.execute(&code, Address(0)).unwrap();
        assert_eq!(vm.register(0), Register(2));
        assert_eq!(vm.register(2), Register(u64::MAX - 2));
        assert_eq!(vm.register(3), Register(15));
        assert_eq!(vm.register(4), Register(3));
        assert_eq!(vm.register(5), Register(1));
        assert_eq!(vm.register(6), Register(16));
        assert_eq!(vm.register(8), Register(0));
    }

    #[test]
    fn test_division_by_zero_faults() {
        let code = [op(Opcode::Nop, 0, 0), op(Opcode::Mod, 0, 1)];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(0, Register(9));
        assert_eq!(
            vm.execute(&code, Address(0)),
            Err(VMError::DivisionByZero { address: 1 })
        );
    }

    #[test]
    fn test_double_arithmetic() {
        let code = [op(Opcode::DAdd, 0, 1), op(Opcode::DMul, 0, 1)];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(0, Register::from_f64(1.5));
        vm.set_register(1, Register::from_f64(2.0));
        vm.execute(&code, Address(0)).unwrap();
        assert_eq!(vm.register(0).as_f64(), 7.0);
    }

    #[test]
    fn test_store_then_load() {
        let code = [op(Opcode::Store32, 1, 2), op(Opcode::Load16, 3, 1)];
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(1, Register(0x40));
        vm.set_register(2, Register(0xDEAD_BEEF));
        vm.set_register(3, Register(0xFFFF_FFFF_0000_0000));
        vm.execute(&code, Address(0)).unwrap();
        assert_eq!(vm.memory().read(Address(0x43)), Ok(0xDE));
        assert_eq!(vm.register(3), Register(0xFFFF_FFFF_0000_BEEF));
    }

    #[test]
    fn test_load_from_static_data() {
        let code = [op(Opcode::Load8, 0, 1)];
        let (mut vm, _) = quiet_vm(b"xyz");
        vm.set_register(1, Register(Address::static_data(2).value()));
        vm.execute(&code, Address(0)).unwrap();
        assert_eq!(vm.register(0), Register(u64::from(b'z')));
    }

    #[test]
    fn test_store_to_static_data_faults() {
        let code = [op(Opcode::Store8, 1, 0)];
        let (mut vm, _) = quiet_vm(b"xyz");
        vm.set_register(1, Register(Address::static_data(0).value()));
        assert_eq!(
            vm.execute(&code, Address(0)),
            Err(VMError::WriteToStatic { offset: 0 })
        );
    }

    #[test]
    fn test_fault_scenarios() {
        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(
            vm.execute(&[op(Opcode::Nop, 0, 0), OneStep(0xFF00)], Address(0)),
            Err(VMError::UnknownOpcode {
                address: 1,
                opcode: 0xFF
            })
        );

        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(
            vm.execute(&[op(Opcode::Pop8, 0, 0)], Address(0)),
            Err(VMError::StackUnderflow {
                requested: 1,
                available: 0
            })
        );

        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(
            vm.execute(&[op(Opcode::Load8, 0, 1)], Address(0)),
            Err(VMError::MemoryAccess {
                space: AddressSpace::Dynamic,
                offset: 0
            })
        );

        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(
            vm.execute(&[op(Opcode::Ret, 0, 0)], Address(0)),
            Err(VMError::CallStackUnderflow { address: 0 })
        );
    }

    #[test]
    fn test_program_counter_bounds() {
        let code = [op(Opcode::Nop, 0, 0)];
        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(vm.execute(&code, Address(1)), Ok(Termination::EndOfCode));
        assert_eq!(
            vm.execute(&code, Address(2)),
            Err(VMError::ProgramCounterOutOfRange {
                address: 2,
                code_len: 1
            })
        );
        assert!(vm.execute(&code, Address::static_data(0)).is_err());
    }

    #[test]
    fn test_unknown_builtin() {
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(0, Register(Address::static_data(99).value()));
        assert_eq!(
            vm.execute(&[op(Opcode::Call, 0, 0)], Address(0)),
            Err(VMError::UnknownBuiltin { address: 0, id: 99 })
        );
    }

    #[test]
    fn test_exit_stops_execution() {
        let mut code = CodeBuilder::new();
        code.push_u64(7).call_builtin(15, Builtin::Exit);
        code.emit(Opcode::Not, 0, 0);
        let (mut vm, _) = quiet_vm(&[]);
        assert_eq!(
            vm.execute(&code.finish(), Address(0)),
            Ok(Termination::Exit(7))
        );
        assert_eq!(vm.register(0), Register(0));
    }

    #[test]
    fn test_limits() {
        let limits = Limits {
            max_stack_bytes: 2,
            max_call_depth: 1,
            heap_base: 0x2000,
            max_heap_bytes: 16,
        };
        let (vm, _) = quiet_vm(&[]);
        let mut vm = vm.with_limits(limits);
        let pushes = [op(Opcode::PushR16, 0, 0), op(Opcode::PushR8, 0, 0)];
        assert_eq!(
            vm.execute(&pushes, Address(0)),
            Err(VMError::StackOverflow { limit: 2 })
        );

        let (vm, _) = quiet_vm(&[]);
        let mut vm = vm.with_limits(limits);
        // Calls itself forever.
        assert_eq!(
            vm.execute(&[op(Opcode::Call, 0, 0)], Address(0)),
            Err(VMError::CallDepthExceeded { limit: 1 })
        );
    }

    #[test]
    fn test_register_display() {
        let (mut vm, _) = quiet_vm(&[]);
        vm.set_register(1, Register(0xff));
        let text = vm.to_string();
        assert!(text.starts_with("r0:0 r1:ff r2:0"));
        assert!(text.ends_with("r15:0"));
    }
}
