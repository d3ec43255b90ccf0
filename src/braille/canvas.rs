/// Dot bits within one braille cell, indexed by [y][x]
const DOTS: [[u8; 2]; 4] = [[0x01, 0x08], [0x02, 0x10], [0x04, 0x20], [0x40, 0x80]];

const BLANK: u32 = 0x2800;

/// Braille Unicode canvas. Each character cell is a 2x4 dot grid, so the
/// pixel resolution is `width * 2` by `height * 4`.
pub struct BrailleCanvas {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl BrailleCanvas {
    /// Canvas of `width` x `height` characters
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn set_pixel(&mut self, x: usize, y: usize) {
        let (cx, cy) = (x / 2, y / 4);
        if cx >= self.width || cy >= self.height {
            return;
        }
        self.cells[cy * self.width + cx] |= DOTS[y % 4][x % 2];
    }

    /// Negative coordinates are ignored
    pub fn set_pixel_signed(&mut self, x: i32, y: i32) {
        if x >= 0 && y >= 0 {
            self.set_pixel(x as usize, y as usize);
        }
    }

    /// Character at a cell, None when the cell has no dots
    pub fn cell(&self, col: usize, row: usize) -> Option<char> {
        if col >= self.width || row >= self.height {
            return None;
        }
        match self.cells[row * self.width + col] {
            0 => None,
            bits => char::from_u32(BLANK + bits as u32),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|&b| b == 0)
    }

    pub fn row(&self, row: usize) -> String {
        if row >= self.height {
            return String::new();
        }
        self.cells[row * self.width..(row + 1) * self.width]
            .iter()
            .map(|&b| char::from_u32(BLANK + b as u32).unwrap_or(' '))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pixel() {
        let mut canvas = BrailleCanvas::new(1, 1);
        canvas.set_pixel(0, 0);
        assert_eq!(canvas.row(0), "⠁");
    }

    #[test]
    fn test_all_dots() {
        let mut canvas = BrailleCanvas::new(1, 1);
        for x in 0..2 {
            for y in 0..4 {
                canvas.set_pixel(x, y);
            }
        }
        assert_eq!(canvas.cell(0, 0), Some('⣿'));
    }

    #[test]
    fn test_diagonal_spans_cells() {
        let mut canvas = BrailleCanvas::new(2, 1);
        for i in 0..4 {
            canvas.set_pixel(i, i);
        }
        assert_eq!(canvas.row(0), "⠑⢄");
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut canvas = BrailleCanvas::new(1, 1);
        canvas.set_pixel(2, 0);
        canvas.set_pixel_signed(-1, 0);
        assert!(canvas.is_blank());
        assert_eq!(canvas.cell(0, 0), None);
    }
}
