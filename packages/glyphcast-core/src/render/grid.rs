//! Deterministic participant grid layout and cell tiling.

/// Chooses the `rows × cols` arrangement for `k` visible participants.
///
/// Picks `cols = ceil(sqrt(k))` and `rows = ceil(k / cols)`, which minimizes
/// `|rows - cols|` with `cols >= rows`. Deterministic: the same `k` always
/// yields the same layout, which is what makes the clear-screen barrier a
/// pure function of the source count.
pub fn grid_dimensions(k: usize) -> (usize, usize) {
    if k == 0 {
        return (0, 0);
    }
    let cols = (k as f64).sqrt().ceil() as usize;
    let rows = k.div_ceil(cols);
    (rows, cols)
}

/// Cell size for a terminal of `term_w × term_h` split into the grid.
/// Never returns zero-sized cells.
pub fn cell_dimensions(
    term_w: u16,
    term_h: u16,
    rows: usize,
    cols: usize,
) -> (usize, usize) {
    (
        (term_w as usize / cols.max(1)).max(1),
        (term_h as usize / rows.max(1)).max(1),
    )
}

/// Tiles per-participant cells into one self-contained frame string.
///
/// Every cell must be `cell_h` newline-terminated lines (the converter
/// guarantees this); missing trailing cells are blank-filled. The output
/// carries no cursor addressing, so a client repaints it from home position.
pub fn compose_grid(
    cells: &[String],
    rows: usize,
    cols: usize,
    cell_w: usize,
    cell_h: usize,
) -> String {
    let blank_line = " ".repeat(cell_w);
    let mut out = String::with_capacity(rows * cell_h * cols * (cell_w + 4));
    for row in 0..rows {
        let mut row_lines: Vec<std::str::Lines> = (0..cols)
            .map(|col| {
                cells
                    .get(row * cols + col)
                    .map(|cell| cell.lines())
                    .unwrap_or("".lines())
            })
            .collect();
        for _ in 0..cell_h {
            for lines in row_lines.iter_mut() {
                match lines.next() {
                    Some(line) => out.push_str(line),
                    None => out.push_str(&blank_line),
                }
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_deterministic_and_sufficient() {
        let expected = [
            (1, (1, 1)),
            (2, (1, 2)),
            (3, (2, 2)),
            (4, (2, 2)),
            (5, (2, 3)),
            (6, (2, 3)),
            (7, (3, 3)),
            (9, (3, 3)),
            (10, (3, 4)),
        ];
        for (k, layout) in expected {
            assert_eq!(grid_dimensions(k), layout, "k = {k}");
        }
        for k in 1..=64 {
            let (rows, cols) = grid_dimensions(k);
            assert!(rows * cols >= k);
            assert!(cols >= rows);
        }
    }

    #[test]
    fn zero_participants_yield_empty_grid() {
        assert_eq!(grid_dimensions(0), (0, 0));
    }

    #[test]
    fn cell_dimensions_divide_terminal() {
        assert_eq!(cell_dimensions(80, 24, 1, 1), (80, 24));
        assert_eq!(cell_dimensions(80, 24, 2, 2), (40, 12));
        // Tiny terminals still get 1x1 cells.
        assert_eq!(cell_dimensions(1, 1, 3, 3), (1, 1));
    }

    #[test]
    fn compose_tiles_cells_side_by_side() {
        let a = "aa\naa\n".to_string();
        let b = "bb\nbb\n".to_string();
        let grid = compose_grid(&[a, b], 1, 2, 2, 2);
        assert_eq!(grid, "aabb\naabb\n");
    }

    #[test]
    fn compose_blank_fills_missing_cells() {
        let a = "aa\naa\n".to_string();
        let grid = compose_grid(&[a.clone(), a.clone(), a], 2, 2, 2, 2);
        let lines: Vec<&str> = grid.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "aa  ");
        assert_eq!(lines[3], "aa  ");
    }
}
