use crate::app::App;
use gridmap::assign::AssignmentStore;
use gridmap::braille::BrailleCanvas;
use gridmap::map::MapLayers;
use gridmap::model::{AssetCategory, ConstraintLevel};
use gridmap::quota::{QuotaPhase, QuotaStore};
use gridmap::surface::Popup;
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
    Frame,
};

/// Render the UI
pub fn render<Q: QuotaStore, A: AssignmentStore>(frame: &mut Frame, app: &App<Q, A>) {
    let area = frame.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),    // Map
            Constraint::Length(1), // Status bar
        ])
        .split(area);

    render_map(frame, app, chunks[0]);
    render_status_bar(frame, app, chunks[1]);

    if let Some(popup) = app.selection_details() {
        render_popup(frame, &popup, chunks[0]);
    }
}

fn tone_color(level: ConstraintLevel) -> Color {
    match level {
        ConstraintLevel::Low => Color::Green,
        ConstraintLevel::Medium => Color::Yellow,
        ConstraintLevel::High => Color::LightRed,
        ConstraintLevel::Critical => Color::Red,
    }
}

fn render_map<Q: QuotaStore, A: AssignmentStore>(frame: &mut Frame, app: &App<Q, A>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            " Grid Assets ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let layers = app.surface.render(inner.width as usize, inner.height as usize);
    frame.render_widget(MapWidget { layers }, inner);
}

/// Braille map with marker glyphs overlaid
struct MapWidget {
    layers: MapLayers,
}

impl MapWidget {
    /// Render a braille canvas layer with a specific color
    fn render_layer(canvas: &BrailleCanvas, color: Color, area: Rect, buf: &mut Buffer) {
        let rows = canvas.height().min(area.height as usize);
        let cols = canvas.width().min(area.width as usize);
        for row in 0..rows {
            for col in 0..cols {
                if let Some(ch) = canvas.cell(col, row) {
                    buf[(area.x + col as u16, area.y + row as u16)].set_char(ch).set_fg(color);
                }
            }
        }
    }
}

impl Widget for MapWidget {
    fn render(self, area: Rect, buf: &mut Buffer) {
        // back to front
        Self::render_layer(&self.layers.coastlines, Color::Cyan, area, buf);
        Self::render_layer(&self.layers.borders, Color::DarkGray, area, buf);
        Self::render_layer(&self.layers.dimmed, Color::DarkGray, area, buf);
        Self::render_layer(&self.layers.connections, Color::Blue, area, buf);
        Self::render_layer(&self.layers.highlighted, Color::LightYellow, area, buf);

        for marker in &self.layers.markers {
            if marker.col >= area.width || marker.row >= area.height {
                continue;
            }
            let mut style = Style::default()
                .fg(tone_color(marker.tone))
                .add_modifier(Modifier::BOLD);
            if let Some(ring) = marker.ring {
                style = style.bg(match ring {
                    ConstraintLevel::Low => Color::Rgb(0, 60, 0),
                    ConstraintLevel::Medium => Color::Rgb(70, 60, 0),
                    ConstraintLevel::High => Color::Rgb(80, 30, 0),
                    ConstraintLevel::Critical => Color::Rgb(90, 0, 0),
                });
            }
            buf[(area.x + marker.col, area.y + marker.row)]
                .set_char(marker.glyph)
                .set_style(style);
        }
    }
}

/// Selection details in the top-right corner of the map
fn render_popup(frame: &mut Frame, popup: &Popup, map_area: Rect) {
    let width = popup
        .lines
        .iter()
        .map(|l| l.chars().count())
        .chain(std::iter::once(popup.title.chars().count()))
        .max()
        .unwrap_or(0) as u16
        + 4;
    let width = width.min(map_area.width.saturating_sub(2));
    let height = (popup.lines.len() as u16 + 2).min(map_area.height.saturating_sub(2));
    if width < 8 || height < 3 {
        return;
    }
    let area = Rect {
        x: map_area.x + map_area.width - width - 1,
        y: map_area.y + 1,
        width,
        height,
    };

    let lines: Vec<Line> = popup
        .lines
        .iter()
        .map(|l| Line::from(Span::styled(l.as_str(), Style::default().fg(Color::White))))
        .collect();
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(Span::styled(
            format!(" {} ", popup.title),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ));

    frame.render_widget(Clear, area);
    frame.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: true }), area);
}

fn quota_span<Q: QuotaStore, A: AssignmentStore>(app: &App<Q, A>) -> Span<'static> {
    let Some((state, phase)) = &app.quota else {
        return Span::styled("loads: ? ", Style::default().fg(Color::DarkGray));
    };
    let color = match phase {
        QuotaPhase::Idle | QuotaPhase::PermittedBelowCeiling => Color::Green,
        QuotaPhase::Warning => Color::Yellow,
        QuotaPhase::Exceeded => Color::Red,
    };
    let ceiling = app.session.governor().limits().ceiling;
    Span::styled(
        format!("loads {}/{} ", state.count, ceiling),
        Style::default().fg(color),
    )
}

fn filter_summary<Q: QuotaStore, A: AssignmentStore>(app: &App<Q, A>) -> String {
    let types = if app.filters.asset_types.is_empty() {
        "all".to_string()
    } else {
        app.filters
            .asset_types
            .iter()
            .map(|c| c.label())
            .collect::<Vec<_>>()
            .join(",")
    };
    let risk = app.filters.risk_level;
    let years = app.filters.year_range;
    format!(
        "{types} risk {:.1}-{:.1} {}-{} ",
        risk.min, risk.max, years.min, years.max
    )
}

fn render_status_bar<Q: QuotaStore, A: AssignmentStore>(frame: &mut Frame, app: &App<Q, A>, area: Rect) {
    let dim = Style::default().fg(Color::DarkGray);
    let session_color = match app.session_label() {
        "ready" => Color::Green,
        "degraded" | "blocked" => Color::Red,
        _ => Color::Yellow,
    };

    let mut spans = vec![
        Span::styled(" ", dim),
        Span::styled(app.zoom_level(), Style::default().fg(Color::Yellow)),
        Span::styled(" (", dim),
        Span::styled(app.lod_level(), Style::default().fg(Color::Magenta)),
        Span::styled(") ", dim),
        Span::styled(app.session_label(), Style::default().fg(session_color)),
        Span::styled(" | ", dim),
        quota_span(app),
        Span::styled("| ", dim),
        Span::styled(filter_summary(app), Style::default().fg(Color::Cyan)),
    ];
    if app.is_fetching() {
        spans.push(Span::styled("loading data ", Style::default().fg(Color::Yellow)));
    }
    match &app.notice {
        Some(notice) => {
            spans.push(Span::styled("| ", dim));
            spans.push(Span::styled(notice.clone(), Style::default().fg(Color::LightRed)));
        }
        None => {
            spans.push(Span::styled("| ", dim));
            spans.push(Span::styled(app.center_coords(), Style::default().fg(Color::Cyan)));
            spans.push(Span::styled(
                format!(
                    " | 1-{}:type [ ]:risk , . < >:year f:fit r:reload q:quit",
                    AssetCategory::ALL.len()
                ),
                dim,
            ));
        }
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}
