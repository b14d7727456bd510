//! RGB image → ASCII cell conversion.
//!
//! Pure functions: an RGB8 image in, a UTF-8 cell of exactly `cell_h` lines
//! by `cell_w` visible columns out, glyphs optionally wrapped in ANSI color
//! escapes according to the client's color level and render mode.

use crate::protocol::control::{ColorLevel, RenderMode};

use super::palette::Palette;

/// Conversion options snapshotted from a client's capabilities.
#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    /// When false the image is letterboxed to preserve aspect ratio,
    /// accounting for the ~2:1 height of terminal cells.
    pub stretch: bool,
}

/// Rec. 601 luma from RGB.
fn luminance(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// Box-averages the source region covered by one output sample.
fn sample(rgb: &[u8], img_w: u32, x0: u32, x1: u32, y0: u32, y1: u32) -> (u8, u8, u8) {
    let x1 = x1.max(x0 + 1);
    let y1 = y1.max(y0 + 1);
    let (mut r, mut g, mut b, mut n) = (0u64, 0u64, 0u64, 0u64);
    for y in y0..y1 {
        let row = (y * img_w) as usize * 3;
        for x in x0..x1 {
            let offset = row + x as usize * 3;
            r += rgb[offset] as u64;
            g += rgb[offset + 1] as u64;
            b += rgb[offset + 2] as u64;
            n += 1;
        }
    }
    ((r / n) as u8, (g / n) as u8, (b / n) as u8)
}

fn push_fg(out: &mut String, level: ColorLevel, r: u8, g: u8, b: u8) {
    match level {
        ColorLevel::Mono => {}
        ColorLevel::Ansi16 => out.push_str(&format!("\x1b[{}m", ansi16_code(r, g, b, false))),
        ColorLevel::Ansi256 => out.push_str(&format!("\x1b[38;5;{}m", ansi256_index(r, g, b))),
        ColorLevel::TrueColor => out.push_str(&format!("\x1b[38;2;{r};{g};{b}m")),
    }
}

fn push_bg(out: &mut String, level: ColorLevel, r: u8, g: u8, b: u8) {
    match level {
        ColorLevel::Mono => {}
        ColorLevel::Ansi16 => out.push_str(&format!("\x1b[{}m", ansi16_code(r, g, b, true))),
        ColorLevel::Ansi256 => out.push_str(&format!("\x1b[48;5;{}m", ansi256_index(r, g, b))),
        ColorLevel::TrueColor => out.push_str(&format!("\x1b[48;2;{r};{g};{b}m")),
    }
}

/// Nearest entry in the 16-color set: one bit per channel plus a bright bit.
fn ansi16_code(r: u8, g: u8, b: u8, background: bool) -> u8 {
    let bright = luminance(r, g, b) > 170;
    let index = (r > 96) as u8 | ((g > 96) as u8) << 1 | ((b > 96) as u8) << 2;
    let base = match (background, bright) {
        (false, false) => 30,
        (false, true) => 90,
        (true, false) => 40,
        (true, true) => 100,
    };
    base + index
}

/// Index into the xterm 6×6×6 color cube.
fn ansi256_index(r: u8, g: u8, b: u8) -> u8 {
    let quant = |v: u8| (v as u16 * 5 / 255) as u8;
    16 + 36 * quant(r) + 6 * quant(g) + quant(b)
}

/// Computes the drawn sub-box inside the cell.
///
/// With stretch the whole cell is used; otherwise the image is fitted
/// preserving aspect, treating a terminal cell as two pixels tall.
fn fitted_box(
    img_w: u32,
    img_h: u32,
    cell_w: usize,
    cell_h: usize,
    stretch: bool,
) -> (usize, usize, usize, usize) {
    if stretch || img_w == 0 || img_h == 0 {
        return (0, 0, cell_w, cell_h);
    }
    // Cell pixel space: cell_w columns × cell_h*2 half-rows.
    let box_w = cell_w as u64;
    let box_h = cell_h as u64 * 2;
    let fit_w = (box_h * img_w as u64 / img_h as u64).min(box_w).max(1);
    let fit_h = (box_w * img_h as u64 / img_w as u64).min(box_h).max(2) / 2;
    let (fit_w, fit_h) = (fit_w as usize, (fit_h as usize).max(1));
    let x0 = (cell_w - fit_w) / 2;
    let y0 = (cell_h - fit_h) / 2;
    (x0, y0, fit_w, fit_h)
}

/// Converts an RGB8 image into one ASCII cell.
///
/// The result is exactly `cell_h` lines of `cell_w` visible columns each,
/// newline-terminated, with ANSI attributes reset at every line end so cells
/// can be concatenated side by side.
pub fn image_to_cell(
    rgb: &[u8],
    img_w: u32,
    img_h: u32,
    cell_w: usize,
    cell_h: usize,
    options: &ConvertOptions,
    palette: &Palette,
) -> String {
    debug_assert_eq!(rgb.len(), img_w as usize * img_h as usize * 3);
    if cell_w == 0 || cell_h == 0 {
        return String::new();
    }

    let (x0, y0, fit_w, fit_h) = fitted_box(img_w, img_h, cell_w, cell_h, options.stretch);
    let colored = options.color_level != ColorLevel::Mono;
    let half_block =
        options.render_mode == RenderMode::HalfBlock && colored;
    // Vertical samples per cell row: half blocks pack two.
    let rows_per_cell = if half_block { 2 } else { 1 };
    let sample_rows = fit_h * rows_per_cell;

    let mut out = String::with_capacity(cell_h * (cell_w + 8) * if colored { 12 } else { 1 });
    for row in 0..cell_h {
        if row < y0 || row >= y0 + fit_h {
            out.push_str(&" ".repeat(cell_w));
            out.push('\n');
            continue;
        }
        let fit_row = row - y0;
        out.push_str(&" ".repeat(x0));
        for col in 0..fit_w {
            let sx0 = (col as u32 * img_w) / fit_w as u32;
            let sx1 = ((col + 1) as u32 * img_w) / fit_w as u32;
            if half_block {
                let upper_row = fit_row * 2;
                let sy = |r: usize| (r as u32 * img_h) / sample_rows as u32;
                let (ur, ug, ub) = sample(rgb, img_w, sx0, sx1, sy(upper_row), sy(upper_row + 1));
                let (lr, lg, lb) =
                    sample(rgb, img_w, sx0, sx1, sy(upper_row + 1), sy(upper_row + 2));
                push_fg(&mut out, options.color_level, ur, ug, ub);
                push_bg(&mut out, options.color_level, lr, lg, lb);
                out.push('▀');
            } else {
                let sy0 = (fit_row as u32 * img_h) / fit_h as u32;
                let sy1 = ((fit_row + 1) as u32 * img_h) / fit_h as u32;
                let (r, g, b) = sample(rgb, img_w, sx0, sx1, sy0, sy1);
                match options.render_mode {
                    RenderMode::Background if colored => {
                        push_bg(&mut out, options.color_level, r, g, b);
                        out.push(' ');
                    }
                    _ => {
                        push_fg(&mut out, options.color_level, r, g, b);
                        out.push(palette.glyph(luminance(r, g, b)));
                    }
                }
            }
        }
        if colored {
            out.push_str("\x1b[0m");
        }
        out.push_str(&" ".repeat(cell_w - x0 - fit_w));
        out.push('\n');
    }
    out
}

/// A placeholder cell for a peer whose first frame has not arrived.
pub fn placeholder_cell(cell_w: usize, cell_h: usize, label: &str) -> String {
    let mut out = String::with_capacity(cell_h * (cell_w + 1));
    let label_row = cell_h / 2;
    for row in 0..cell_h {
        if row == label_row && !label.is_empty() {
            let shown: String = label.chars().take(cell_w).collect();
            let shown_width = shown.chars().count();
            let pad_left = (cell_w - shown_width) / 2;
            out.push_str(&" ".repeat(pad_left));
            out.push_str(&shown);
            out.push_str(&" ".repeat(cell_w - pad_left - shown_width));
        } else {
            out.push_str(&" ".repeat(cell_w));
        }
        out.push('\n');
    }
    out
}

/// Number of visible columns in a rendered line (ANSI escapes excluded).
#[cfg(test)]
pub fn visible_width(line: &str) -> usize {
    let mut width = 0;
    let mut in_escape = false;
    for ch in line.chars() {
        if in_escape {
            if ch == 'm' {
                in_escape = false;
            }
        } else if ch == '\x1b' {
            in_escape = true;
        } else {
            width += 1;
        }
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for _ in 0..w * h {
            data.extend_from_slice(&rgb);
        }
        data
    }

    fn options(color_level: ColorLevel, render_mode: RenderMode, stretch: bool) -> ConvertOptions {
        ConvertOptions {
            color_level,
            render_mode,
            stretch,
        }
    }

    #[test]
    fn mono_cell_has_exact_dimensions() {
        let image = solid_image(32, 16, [255, 255, 255]);
        let cell = image_to_cell(
            &image,
            32,
            16,
            10,
            5,
            &options(ColorLevel::Mono, RenderMode::Foreground, true),
            &Palette::default(),
        );
        let lines: Vec<&str> = cell.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            assert_eq!(line.chars().count(), 10);
        }
    }

    #[test]
    fn white_image_uses_brightest_glyph() {
        let palette = Palette::default();
        let image = solid_image(8, 8, [255, 255, 255]);
        let cell = image_to_cell(
            &image,
            8,
            8,
            4,
            2,
            &options(ColorLevel::Mono, RenderMode::Foreground, true),
            &palette,
        );
        let brightest = palette.glyph(255);
        assert!(cell.chars().filter(|c| *c != '\n').all(|c| c == brightest));
    }

    #[test]
    fn truecolor_foreground_carries_rgb_escape() {
        let image = solid_image(8, 8, [200, 10, 30]);
        let cell = image_to_cell(
            &image,
            8,
            8,
            4,
            2,
            &options(ColorLevel::TrueColor, RenderMode::Foreground, true),
            &Palette::default(),
        );
        assert!(cell.contains("\x1b[38;2;200;10;30m"));
        assert!(cell.contains("\x1b[0m"));
    }

    #[test]
    fn half_block_packs_two_rows_per_char() {
        // Top half red, bottom half blue.
        let mut image = solid_image(4, 4, [255, 0, 0]);
        for pixel in image[4 * 2 * 3..].chunks_exact_mut(3) {
            pixel.copy_from_slice(&[0, 0, 255]);
        }
        let cell = image_to_cell(
            &image,
            4,
            4,
            4,
            1,
            &options(ColorLevel::TrueColor, RenderMode::HalfBlock, true),
            &Palette::default(),
        );
        assert!(cell.contains('▀'));
        assert!(cell.contains("\x1b[38;2;255;0;0m"));
        assert!(cell.contains("\x1b[48;2;0;0;255m"));
    }

    #[test]
    fn colored_lines_keep_visible_width() {
        let image = solid_image(16, 16, [1, 2, 3]);
        let cell = image_to_cell(
            &image,
            16,
            16,
            12,
            6,
            &options(ColorLevel::Ansi256, RenderMode::Background, true),
            &Palette::default(),
        );
        for line in cell.lines() {
            assert_eq!(visible_width(line), 12);
        }
    }

    #[test]
    fn letterbox_pads_wide_image() {
        // A very wide image in a square-ish cell must leave blank rows.
        let image = solid_image(64, 4, [255, 255, 255]);
        let cell = image_to_cell(
            &image,
            64,
            4,
            16,
            16,
            &options(ColorLevel::Mono, RenderMode::Foreground, false),
            &Palette::default(),
        );
        let lines: Vec<&str> = cell.lines().collect();
        assert_eq!(lines.len(), 16);
        assert!(lines[0].trim().is_empty());
        assert!(lines[15].trim().is_empty());
        assert!(lines.iter().any(|line| !line.trim().is_empty()));
    }

    #[test]
    fn placeholder_centers_label() {
        let cell = placeholder_cell(10, 3, "bob");
        let lines: Vec<&str> = cell.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].trim(), "bob");
        for line in &lines {
            assert_eq!(line.chars().count(), 10);
        }
    }
}
