use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use structopt::StructOpt;

use dcpu_16::crossterm_screen::CrosstermScreen;
use dcpu_16::machine::keyboard::Key;
use dcpu_16::machine::{ClockRate, Error, Machine, Word};

/// A terminal DCPU-16 emulator.
#[derive(StructOpt, Debug)]
#[structopt(name = "dcpu-16")]
struct Opt {
    /// Clock rate to run the machine at, e.g. 50000, 100kHz or 2MHz
    #[structopt(long = "rate", default_value = "100kHz")]
    rate: ClockRate,

    /// Clock rate to refresh the screen at
    #[structopt(long = "screenRefreshRate", default_value = "60")]
    screen_refresh_rate: ClockRate,

    /// Interpret the program file as little endian
    #[structopt(long = "littleEndian")]
    little_endian: bool,

    /// Print the effective clock rate at termination
    #[structopt(long = "printRate")]
    print_rate: bool,

    /// Compiled program to execute
    #[structopt(parse(from_os_str))]
    program: PathBuf,
}

fn main() {
    let opt = match Opt::from_args_safe() {
        Ok(opt) => opt,
        Err(err) => {
            if err.use_stderr() {
                eprintln!("{}", err.message);
                process::exit(2);
            }
            // --help and --version land here
            err.exit()
        }
    };

    if let Err(err) = init_logging() {
        eprintln!("warning: could not set up logging: {}", err);
    }
    log::info!("executing {:?}", opt.program);

    let data = match fs::read(&opt.program) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("{}: {}", opt.program.display(), err);
            process::exit(1);
        }
    };
    let words = decode_words(&data, opt.little_endian);

    process::exit(run(&opt, &words));
}

/// The machine logs to a file because stdout belongs to the renderer.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {t} - {m}{n}")))
        .build("log/output.log")?;
    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(Root::builder().appender("logfile").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Fold a byte stream into words, big-endian unless told otherwise. A
/// trailing odd byte is dropped.
fn decode_words(data: &[u8], little_endian: bool) -> Vec<Word> {
    data.chunks_exact(2)
        .map(|pair| {
            if little_endian {
                Word::from_le_bytes([pair[0], pair[1]])
            } else {
                Word::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect()
}

fn run(opt: &Opt, words: &[Word]) -> i32 {
    let xterm256 = std::env::var("TERM")
        .map(|term| term.ends_with("-256color"))
        .unwrap_or(false);
    let screen = match CrosstermScreen::new(xterm256) {
        Ok(screen) => screen,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let mut machine = Machine::new(Box::new(screen));
    machine.video.refresh_rate = opt.screen_refresh_rate;
    if let Err(err) = machine.load_program(words, 0) {
        drop(machine);
        eprintln!("{}", err);
        return 1;
    }
    if let Err(err) = machine.start(opt.rate) {
        drop(machine);
        eprintln!("{}", err);
        return 1;
    }

    loop {
        if event::poll(Duration::from_millis(50)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if key.modifiers.contains(KeyModifiers::CONTROL)
                    && key.code == KeyCode::Char('c')
                {
                    let rate = machine.effective_clock_rate();
                    return match machine.stop() {
                        Ok(()) => {
                            drop(machine);
                            if opt.print_rate {
                                println!("Effective clock rate: {}", rate);
                            }
                            0
                        }
                        Err(fault) => report_fault(machine, fault),
                    };
                }
                register_key(&machine, key.code);
            }
        }
        if let Some(fault) = machine.poll_error() {
            let _ = machine.stop();
            return report_fault(machine, fault);
        }
    }
}

/// Dump memory around the fault with `PC` highlighted, once the terminal
/// has been handed back.
fn report_fault(machine: Machine, fault: Error) -> i32 {
    let pc = machine.registers().pc;
    let mut dump = Vec::new();
    let _ = machine.dump_memory(&mut dump, &[pc]);
    drop(machine);
    eprintln!("{}", fault);
    let _ = io::stderr().write_all(&dump);
    1
}

fn register_key(machine: &Machine, code: KeyCode) {
    match code {
        KeyCode::Char(ch) => machine.keyboard.register_key_typed(ch),
        KeyCode::Enter => machine.keyboard.register_key_typed('\n'),
        KeyCode::Tab => machine.keyboard.register_key_typed('\t'),
        other => {
            if let Some(key) = map_key(other) {
                machine.keyboard.register_key_pressed(key);
                machine.keyboard.register_key_released(key);
            }
        }
    }
}

fn map_key(code: KeyCode) -> Option<Key> {
    match code {
        KeyCode::Backspace => Some(Key::Backspace),
        KeyCode::Delete => Some(Key::Delete),
        KeyCode::Left => Some(Key::Left),
        KeyCode::Right => Some(Key::Right),
        KeyCode::Up => Some(Key::Up),
        KeyCode::Down => Some(Key::Down),
        KeyCode::Home => Some(Key::Home),
        KeyCode::End => Some(Key::End),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_words_is_big_endian_by_default() {
        assert_eq!(
            decode_words(&[0x7C, 0x01, 0x00, 0x30], false),
            vec![0x7C01, 0x0030]
        );
    }

    #[test]
    fn decode_words_honours_the_little_endian_flag() {
        assert_eq!(decode_words(&[0x01, 0x7C], true), vec![0x7C01]);
    }

    #[test]
    fn decode_words_drops_a_trailing_odd_byte() {
        assert_eq!(decode_words(&[0x12, 0x34, 0x56], false), vec![0x1234]);
    }
}
