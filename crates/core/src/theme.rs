pub type Rgb = (u8, u8, u8);

// Ocean/steel/stone palette for CLI output.
pub const GRAY_500: Rgb = (149, 161, 172);
pub const STEEL_200: Rgb = (206, 226, 242);

pub fn ansi_fg(text: impl AsRef<str>, rgb: Rgb) -> String {
    let (r, g, b) = rgb;
    format!("\x1b[38;2;{r};{g};{b}m{}\x1b[0m", text.as_ref())
}

pub fn ansi_bold(text: impl AsRef<str>) -> String {
    format!("\x1b[1m{}\x1b[0m", text.as_ref())
}
