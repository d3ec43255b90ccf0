use crate::braille::BrailleCanvas;
use crate::map::projection::Viewport;

/// Bresenham line between two pixels
pub fn draw_line(canvas: &mut BrailleCanvas, x0: i32, y0: i32, x1: i32, y1: i32) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);

    loop {
        canvas.set_pixel_signed(x, y);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            if x == x1 {
                break;
            }
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            if y == y1 {
                break;
            }
            err += dx;
            y += sy;
        }
    }
}

/// Two-pixel-wide line for emphasized connections
pub fn draw_thick_line(canvas: &mut BrailleCanvas, x0: i32, y0: i32, x1: i32, y1: i32) {
    draw_line(canvas, x0, y0, x1, y1);
    if (x1 - x0).abs() > (y1 - y0).abs() {
        draw_line(canvas, x0, y0 + 1, x1, y1 + 1);
    } else {
        draw_line(canvas, x0 + 1, y0, x1 + 1, y1);
    }
}

/// Draw a geographic segment, skipping it when it cannot be on screen
pub fn draw_segment(
    canvas: &mut BrailleCanvas,
    from: (f64, f64),
    to: (f64, f64),
    viewport: &Viewport,
    thick: bool,
) {
    let a = viewport.project(from.0, from.1);
    let b = viewport.project(to.0, to.1);
    if !viewport.line_might_be_visible(a, b) {
        return;
    }
    if thick {
        draw_thick_line(canvas, a.0, a.1, b.0, b.1);
    } else {
        draw_line(canvas, a.0, a.1, b.0, b.1);
    }
}

/// Draw a polyline with viewport culling. Segments wider than the viewport
/// (antimeridian jumps) are dropped.
pub fn draw_path(canvas: &mut BrailleCanvas, line: &[(f64, f64)], viewport: &Viewport) {
    let mut prev: Option<(i32, i32)> = None;
    for &(lon, lat) in line {
        let p = viewport.project(lon, lat);
        if let Some(q) = prev {
            let manhattan = ((p.0 - q.0).abs() + (p.1 - q.1).abs()) as usize;
            if manhattan < viewport.width && viewport.line_might_be_visible(q, p) {
                draw_line(canvas, q.0, q.1, p.0, p.1);
            }
        }
        prev = Some(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizontal_line() {
        let mut canvas = BrailleCanvas::new(5, 1);
        draw_line(&mut canvas, 0, 0, 9, 0);
        assert_eq!(canvas.row(0), "⠉⠉⠉⠉⠉");
    }

    #[test]
    fn test_vertical_line() {
        let mut canvas = BrailleCanvas::new(1, 2);
        draw_line(&mut canvas, 0, 0, 0, 7);
        assert_eq!(canvas.row(0), "⡇");
        assert_eq!(canvas.row(1), "⡇");
    }

    #[test]
    fn test_offscreen_segment_skipped() {
        let viewport = Viewport::new(0.0, 0.0, 64.0, 20, 20);
        let mut canvas = BrailleCanvas::new(10, 5);
        draw_segment(&mut canvas, (100.0, 40.0), (120.0, 45.0), &viewport, false);
        assert!(canvas.is_blank());
    }
}
