/*!

A cycle-accurate DCPU-16 emulator: sixteen opcodes, eight general-purpose
registers, a 64K-word address space and memory-mapped video and keyboard
peripherals, driven at a selectable clock rate.

# Frontend

The crate ships a terminal frontend you can run with
`cargo run --release -- <program>`, where `<program>` is a compiled DCPU-16
image (big-endian words by default; pass `--littleEndian` for the other
byte order). `--rate 2MHz` picks the clock, Ctrl-C stops the machine.

# Library

The machine core is usable on its own. For single stepping, drive the CPU
directly:

```rust
use dcpu_16::machine::cpu::Cpu;

let mut cpu = Cpu::new();
// SET A, 0x30
cpu.memory.load_program(&[0x7C01, 0x0030], 0).unwrap();
cpu.step().unwrap();
assert_eq!(cpu.registers.a, 0x0030);
```

For real-time execution, build a [`machine::Machine`] around a screen and
let the scheduler drive it:

```rust
use dcpu_16::machine::screen::DummyScreen;
use dcpu_16::machine::{ClockRate, Machine};

let mut machine = Machine::new(Box::new(DummyScreen::new()));
// SET PC, 0 - spin in place
machine.load_program(&[0x7DC1, 0x0000], 0).unwrap();
machine.start(ClockRate(10_000)).unwrap();
machine.keyboard.register_key_typed('h');
machine.stop().unwrap();
```

## Custom screens

Programs draw by writing words into the mapped video buffer; the video
peripheral turns those writes into cells on a [`machine::screen::Screen`].
Implement that trait to render anywhere:

```ignore
let mut machine = Machine::new(Box::new(MyScreen::new()));
```

The bundled [`crossterm_screen::CrosstermScreen`] renders to the terminal,
as done by the frontend binary.
*/

pub mod crossterm_screen;
pub mod machine;
