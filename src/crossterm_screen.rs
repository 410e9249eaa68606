//! A [`Screen`] backed by crossterm: raw-mode alternate-screen terminal
//! output with the DCPU-16 color nibbles mapped to terminal colors.

use std::io::{self, Stdout, Write};

use crossterm::style::{
    Attribute, Color as TermColor, Print, SetAttribute, SetBackgroundColor, SetForegroundColor,
};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute, queue};

use crate::machine::screen::{Color, Screen};

/// xterm-256 approximations of the sixteen 4-bit DCPU colors, indexed by
/// nibble. Not exact, but close.
const COLOR_TO_ANSI: [u8; 16] = [
    16, 19, 34, 37, 124, 127, 130, 145, 59, 63, 71, 87, 203, 207, 227, 231,
];

/// Renders cells straight to stdout. Construction switches the terminal to
/// a raw-mode alternate screen; dropping the value switches it back.
pub struct CrosstermScreen {
    out: Stdout,
    xterm256: bool,
}

impl CrosstermScreen {
    /// `xterm256` says whether the host terminal advertises 256-color
    /// support; callers usually derive it from `$TERM`.
    pub fn new(xterm256: bool) -> io::Result<CrosstermScreen> {
        let mut out = io::stdout();
        terminal::enable_raw_mode()?;
        execute!(
            out,
            EnterAlternateScreen,
            cursor::Hide,
            Clear(ClearType::All)
        )?;
        Ok(CrosstermScreen { out, xterm256 })
    }

    fn terminal_color(&self, color: Color) -> TermColor {
        if self.xterm256 {
            // ANSI color 0 instead of xterm 16, so terminals that adjust
            // foregrounds against same-colored backgrounds leave it alone
            if color.0 == 0 {
                TermColor::Black
            } else {
                TermColor::AnsiValue(COLOR_TO_ANSI[usize::from(color.0 & 0xF)])
            }
        } else {
            // fall back on the sixteen ANSI colors: mix the three channels
            // and let the highlight bit pick the bright variant
            match (color.0 & 0x7, color.0 & 0x8 != 0) {
                (0b000, false) => TermColor::Black,
                (0b001, false) => TermColor::DarkBlue,
                (0b010, false) => TermColor::DarkGreen,
                (0b011, false) => TermColor::DarkCyan,
                (0b100, false) => TermColor::DarkRed,
                (0b101, false) => TermColor::DarkMagenta,
                (0b110, false) => TermColor::DarkYellow,
                (0b111, false) => TermColor::Grey,
                (0b000, true) => TermColor::DarkGrey,
                (0b001, true) => TermColor::Blue,
                (0b010, true) => TermColor::Green,
                (0b011, true) => TermColor::Cyan,
                (0b100, true) => TermColor::Red,
                (0b101, true) => TermColor::Magenta,
                (0b110, true) => TermColor::Yellow,
                _ => TermColor::White,
            }
        }
    }
}

impl Screen for CrosstermScreen {
    fn set_cell(&mut self, column: u16, row: u16, ch: char, fg: Color, bg: Color, blink: bool) {
        let fg = self.terminal_color(fg);
        let bg = self.terminal_color(bg);
        let mut result = queue!(
            self.out,
            cursor::MoveTo(column, row),
            SetAttribute(Attribute::Reset),
            SetForegroundColor(fg),
            SetBackgroundColor(bg)
        );
        if blink {
            result = result.and_then(|_| queue!(self.out, SetAttribute(Attribute::SlowBlink)));
        }
        if let Err(err) = result.and_then(|_| queue!(self.out, Print(ch))) {
            log::warn!("could not queue cell update: {}", err);
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.out.flush() {
            log::warn!("could not flush the terminal: {}", err);
        }
    }
}

impl Drop for CrosstermScreen {
    fn drop(&mut self) {
        let _ = execute!(self.out, cursor::Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ansi_table_covers_every_nibble() {
        // spot-check the corners of the 256-color table
        assert_eq!(COLOR_TO_ANSI[0x0], 16); // black
        assert_eq!(COLOR_TO_ANSI[0xF], 231); // bright white
        assert_eq!(COLOR_TO_ANSI.len(), 16);
    }
}
