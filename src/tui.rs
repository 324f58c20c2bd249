use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Terminal;
use tokio::sync::mpsc;

use crate::alerts::{Delivery, VolumeAlertRecord};
use crate::cache::CacheStats;
use crate::detection::AlertSeverity;
use crate::pipeline::Pipeline;
use crate::registry::ChannelTransport;
use crate::resilience::BreakerState;
use crate::service::ServiceStatus;
use crate::types::{ServerMessage, SubscriberId};

/// Subscriber id of the dashboard's own in-process push session.
pub const DASHBOARD_SUBSCRIBER: SubscriberId = 0;

struct App {
    alerts: Vec<VolumeAlertRecord>,
    severity_counts: HashMap<&'static str, u64>,
    status: Option<ServiceStatus>,
    cache: Option<CacheStats>,
    prices: HashMap<String, (f64, f64)>,
    push_alerts: u64,
    uptime: Instant,
    should_quit: bool,
    scroll_offset: usize,
}

impl App {
    fn new() -> Self {
        Self {
            alerts: Vec::new(),
            severity_counts: HashMap::new(),
            status: None,
            cache: None,
            prices: HashMap::new(),
            push_alerts: 0,
            uptime: Instant::now(),
            should_quit: false,
            scroll_offset: 0,
        }
    }

    fn refresh(&mut self, pipeline: &Pipeline) {
        {
            let log = pipeline.alerts.lock();
            self.alerts = log.recent(200);
            self.severity_counts = log.severity_counts().clone();
        }
        self.status = Some(pipeline.service.status());
        self.cache = Some(pipeline.cache.stats());
    }

    fn drain_push(&mut self, rx: &mut mpsc::UnboundedReceiver<String>) {
        while let Ok(payload) = rx.try_recv() {
            match serde_json::from_str::<ServerMessage>(&payload) {
                Ok(ServerMessage::PriceUpdate { symbol, data, .. }) => {
                    self.prices.insert(symbol, (data.last, data.percentage_change));
                }
                Ok(ServerMessage::VolumeAlert { .. }) => self.push_alerts += 1,
                _ => {}
            }
        }
    }
}

pub async fn run(pipeline: Arc<Pipeline>, symbols: Vec<String>, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &pipeline, symbols, duration).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    pipeline: &Pipeline,
    symbols: Vec<String>,
    duration: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (transport, mut rx) = ChannelTransport::pair(DASHBOARD_SUBSCRIBER);
    pipeline.registry.connect(DASHBOARD_SUBSCRIBER, transport).await?;
    for symbol in &symbols {
        pipeline.registry.subscribe(DASHBOARD_SUBSCRIBER, symbol);
    }
    let sweeper = pipeline.start();
    let mut app = App::new();

    let run_duration = if duration == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs(duration)
    };

    while !app.should_quit && app.uptime.elapsed() < run_duration {
        app.drain_push(&mut rx);
        app.refresh(pipeline);
        terminal.draw(|f| draw(f, &app))?;

        // Handle input
        if event::poll(Duration::from_millis(150))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                        KeyCode::Up => app.scroll_offset = app.scroll_offset.saturating_sub(1),
                        KeyCode::Down => app.scroll_offset = app.scroll_offset.saturating_add(1),
                        _ => {}
                    }
                }
            }
        }
        tokio::task::yield_now().await;
    }

    pipeline.service.shutdown().await;
    pipeline.registry.disconnect(DASHBOARD_SUBSCRIBER);
    sweeper.abort();
    Ok(())
}

fn draw(f: &mut ratatui::Frame, app: &App) {
    let size = f.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // header
            Constraint::Min(10),   // alert feed
            Constraint::Length(9), // timings + cache
            Constraint::Length(9), // severities + prices
        ])
        .split(size);

    draw_header(f, app, chunks[0]);
    draw_alert_feed(f, app, chunks[1]);
    draw_timings_and_cache(f, app, chunks[2]);
    draw_counts_and_prices(f, app, chunks[3]);
}

fn draw_header(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let elapsed = app.uptime.elapsed().as_secs();
    let (breaker, breaker_color, connections, provider) = match &app.status {
        Some(status) => {
            let color = match status.breaker.state {
                BreakerState::Closed => Color::Green,
                BreakerState::HalfOpen => Color::Yellow,
                BreakerState::Open => Color::Red,
            };
            (
                format!("{:?}", status.breaker.state),
                color,
                status.registry.total_connections,
                status.provider.clone(),
            )
        }
        None => ("-".to_string(), Color::DarkGray, 0, "-".to_string()),
    };

    let header = vec![
        Span::styled(" volume-watch ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled(format!("Alerts: {}", app.alerts.len()), Style::default().fg(Color::Yellow)),
        Span::raw(" | "),
        Span::styled(format!("Pushed: {}", app.push_alerts), Style::default().fg(Color::Green)),
        Span::raw(" | "),
        Span::styled(format!("Sessions: {connections}"), Style::default().fg(Color::Blue)),
        Span::raw(" | "),
        Span::raw("Breaker: "),
        Span::styled(breaker, Style::default().fg(breaker_color).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::raw(format!("Uptime: {elapsed}s")),
        Span::raw(" | "),
        Span::styled("q=quit  Up/Down=scroll", Style::default().fg(Color::DarkGray)),
    ];
    let p = Paragraph::new(Line::from(header))
        .block(Block::default().borders(Borders::ALL).title(format!(" {provider} ")));
    f.render_widget(p, area);
}

fn delivery_cell(delivery: &Delivery) -> Cell<'static> {
    let color = match delivery {
        Delivery::Sent => Color::Green,
        Delivery::Skipped => Color::DarkGray,
        Delivery::Failed(_) => Color::Red,
    };
    Cell::from(Span::styled(delivery.label(), Style::default().fg(color)))
}

fn draw_alert_feed(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let max_visible = (area.height as usize).saturating_sub(3);
    let total = app.alerts.len();

    let rows: Vec<Row> = app
        .alerts
        .iter()
        .skip(app.scroll_offset)
        .take(max_visible)
        .map(|alert| {
            let (sev_str, sev_color) = match alert.severity {
                AlertSeverity::Critical => ("CRIT", Color::Red),
                AlertSeverity::High => ("HIGH", Color::Yellow),
                AlertSeverity::Medium => (" MED", Color::Cyan),
            };
            Row::new(vec![
                Cell::from(Span::styled(sev_str, Style::default().fg(sev_color).add_modifier(Modifier::BOLD))),
                Cell::from(format!("{:<10}", alert.symbol)),
                Cell::from(alert.subscriber_id.to_string()),
                Cell::from(format!(
                    "{:.0} vs {:.0} ({:.1}x)",
                    alert.verdict.current_volume, alert.verdict.avg_volume, alert.verdict.multiplier
                )),
                delivery_cell(&alert.push),
                delivery_cell(&alert.messaging),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(5),
            Constraint::Length(11),
            Constraint::Length(6),
            Constraint::Min(30),
            Constraint::Length(8),
            Constraint::Length(8),
        ],
    )
    .header(
        Row::new(vec!["SEV", "SYMBOL", "SUB", "VOLUME", "PUSH", "BOT"])
            .style(Style::default().add_modifier(Modifier::BOLD).fg(Color::White)),
    )
    .block(Block::default().borders(Borders::ALL).title(format!(" Alert Feed ({total}) ")));

    f.render_widget(table, area);
}

fn draw_timings_and_cache(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let mut timing_text = Vec::new();
    if let Some(status) = &app.status {
        let t = &status.timings;
        for (label, stats, color) in [
            ("  Price:    ", &t.price_tick, Color::Green),
            ("  Anomaly:  ", &t.anomaly_tick, Color::Cyan),
            ("  Dispatch: ", &t.dispatch, Color::Yellow),
        ] {
            timing_text.push(Line::from(vec![
                Span::styled(label, Style::default().fg(color)),
                Span::raw(format!("p50={:<8} p95={:<8} p99={:<8}", stats.p50_us, stats.p95_us, stats.p99_us)),
            ]));
        }
        timing_text.push(Line::from(""));
        timing_text.push(Line::from(vec![
            Span::styled("  Ticks: ", Style::default().fg(Color::DarkGray)),
            Span::raw(format!("{} price / {} anomaly", t.price_ticks, t.anomaly_ticks)),
            Span::raw("  "),
            Span::styled("Failed: ", Style::default().fg(Color::DarkGray)),
            Span::raw(t.failed_ticks.to_string()),
        ]));
    }
    let timing_widget = Paragraph::new(timing_text)
        .block(Block::default().borders(Borders::ALL).title(" Tick Timings (us) "));
    f.render_widget(timing_widget, chunks[0]);

    let cache_rows: Vec<Row> = app
        .cache
        .iter()
        .flat_map(|stats| stats.domains.iter())
        .map(|(name, d)| {
            let color = if d.total_items > 0 { Color::Green } else { Color::DarkGray };
            Row::new(vec![
                Cell::from(Span::styled(format!("{name:<15}"), Style::default().fg(color))),
                Cell::from(d.total_items.to_string()),
                Cell::from(format!("{:.1}%", d.hit_rate)),
                Cell::from(d.evictions.to_string()),
            ])
        })
        .collect();

    let cache_table = Table::new(
        cache_rows,
        [Constraint::Length(16), Constraint::Length(7), Constraint::Length(8), Constraint::Min(6)],
    )
    .header(Row::new(vec!["DOMAIN", "ITEMS", "HITS", "EVICT"]).style(Style::default().add_modifier(Modifier::BOLD)))
    .block(Block::default().borders(Borders::ALL).title(" Cache "));
    f.render_widget(cache_table, chunks[1]);
}

fn draw_counts_and_prices(f: &mut ratatui::Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let count_rows: Vec<Row> = [AlertSeverity::Critical, AlertSeverity::High, AlertSeverity::Medium]
        .iter()
        .map(|severity| {
            let c = app.severity_counts.get(severity.label()).copied().unwrap_or(0);
            let color = if c > 0 { Color::Yellow } else { Color::DarkGray };
            Row::new(vec![
                Cell::from(Span::styled(format!("{:<18}", severity.label()), Style::default().fg(color))),
                Cell::from(Span::styled(c.to_string(), Style::default().fg(color))),
            ])
        })
        .collect();

    let count_table = Table::new(count_rows, [Constraint::Length(19), Constraint::Min(6)])
        .block(Block::default().borders(Borders::ALL).title(" Alerts by Severity "));
    f.render_widget(count_table, chunks[0]);

    let mut symbols: Vec<_> = app.prices.iter().collect();
    symbols.sort_by(|a, b| a.0.cmp(b.0));
    let price_rows: Vec<Row> = symbols
        .iter()
        .map(|(sym, (price, change))| {
            let color = if *change >= 0.0 { Color::Green } else { Color::Red };
            Row::new(vec![
                Cell::from(Span::styled(format!("{sym:<10}"), Style::default().fg(Color::White).add_modifier(Modifier::BOLD))),
                Cell::from(format!("{price:.4}")),
                Cell::from(Span::styled(format!("{change:+.2}%"), Style::default().fg(color))),
            ])
        })
        .collect();

    let price_table = Table::new(price_rows, [Constraint::Length(11), Constraint::Length(14), Constraint::Min(8)])
        .block(Block::default().borders(Borders::ALL).title(" Live Prices "));
    f.render_widget(price_table, chunks[1]);
}
