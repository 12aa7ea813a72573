// UI Module - Terminal panel: channels, buttons, device status, WiFi and events
use anyhow::Result;
use crossterm::event::{poll, read, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::{Frame, Terminal};
use std::io::{self, Stdout};
use std::time::Duration;
use tracing::warn;

use crate::config::PanelConfig;
use crate::logging::LogBuffer;
use crate::panel::{PanelModel, WifiView};
use crate::session::Session;
use crate::types::{SessionExit, BUTTON_COUNT, CHANNEL_COUNT};
use crate::wifi::WifiScanOutcome;

const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    SelectPrev,
    SelectNext,
    Nudge { up: bool },
    Off,
    Full,
    WifiScan,
    ToggleInfo,
}

/// Key to action; only presses count so Windows release events are ignored
pub fn action_for(key: KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(Action::Quit),
        KeyCode::Up => Some(Action::SelectPrev),
        KeyCode::Down => Some(Action::SelectNext),
        KeyCode::Right => Some(Action::Nudge { up: true }),
        KeyCode::Left => Some(Action::Nudge { up: false }),
        KeyCode::Char('0') => Some(Action::Off),
        KeyCode::Char('f') | KeyCode::Char('F') => Some(Action::Full),
        KeyCode::Char('w') | KeyCode::Char('W') => Some(Action::WifiScan),
        KeyCode::Char('i') | KeyCode::Char('I') => Some(Action::ToggleInfo),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiState {
    pub selected: usize,
    pub show_info: bool,
}

impl UiState {
    fn select(&mut self, up: bool) {
        self.selected = if up {
            (self.selected + CHANNEL_COUNT - 1) % CHANNEL_COUNT
        } else {
            (self.selected + 1) % CHANNEL_COUNT
        };
    }
}

fn apply_action(action: Action, state: &mut UiState, session: &mut Session) -> Option<SessionExit> {
    let result = match action {
        Action::Quit => return Some(SessionExit::UserQuit),
        Action::SelectPrev => {
            state.select(true);
            Ok(())
        }
        Action::SelectNext => {
            state.select(false);
            Ok(())
        }
        Action::ToggleInfo => {
            state.show_info = !state.show_info;
            Ok(())
        }
        Action::Nudge { up } => session.nudge(state.selected, up).map(|_| ()),
        Action::Off => session.set_level(state.selected, 0).map(|_| ()),
        Action::Full => session.set_level(state.selected, u8::MAX).map(|_| ()),
        Action::WifiScan => session.start_wifi_scan(),
    };
    if let Err(e) = result {
        warn!("{:#}", e);
    }
    None
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor()?;
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    Ok(())
}

/// Blocking TUI loop. Background tasks keep running on the session's runtime.
pub fn run(session: &mut Session, log: &LogBuffer, config: &PanelConfig) -> Result<SessionExit> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let mut state = UiState::default();
    let exit = loop {
        if poll(Duration::from_millis(50))? {
            if let Event::Key(key) = read()? {
                if let Some(action) = action_for(key) {
                    if let Some(exit) = apply_action(action, &mut state, session) {
                        break exit;
                    }
                }
            }
        }

        if !session.drain_events() {
            break SessionExit::EventsClosed;
        }

        if let Err(e) = draw(&mut terminal, session, &state, log, config) {
            restore_terminal(&mut terminal)?;
            return Err(e);
        }
    };

    restore_terminal(&mut terminal)?;
    Ok(exit)
}

pub fn draw<B: Backend>(
    terminal: &mut Terminal<B>,
    session: &Session,
    state: &UiState,
    log: &LogBuffer,
    config: &PanelConfig,
) -> Result<()> {
    terminal.draw(|f| render(f, session.panel(), session.host(), state, log, config))?;
    Ok(())
}

fn render(
    f: &mut Frame,
    panel: &PanelModel,
    host: &str,
    state: &UiState,
    log: &LogBuffer,
    config: &PanelConfig,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),                        // Header
            Constraint::Length(CHANNEL_COUNT as u16 + 2), // Channels
            Constraint::Length(BUTTON_COUNT as u16 + 5),  // Buttons + status
            Constraint::Min(6),                           // WiFi + events
            Constraint::Length(3),                        // Footer
        ])
        .split(f.size());

    // Header - device and socket status, controls on the right
    let header_width = chunks[0].width.saturating_sub(2) as usize;
    let socket = if panel.socket_connected { "🟢 live" } else { "🔴 offline" };
    let left_text = format!("💡 DMX Panel | {} | {}", host, socket);
    let right_text = "↑↓ select ←→ dim 0 off f full w wifi i info q quit";
    let spacing = header_width.saturating_sub(left_text.chars().count() + right_text.chars().count());
    let header = Paragraph::new(Line::from(vec![
        Span::raw(left_text),
        Span::raw(" ".repeat(spacing)),
        Span::styled(right_text, Style::default().fg(Color::DarkGray)),
    ]))
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(header, chunks[0]);

    let channels = Paragraph::new(channel_lines(panel, state.selected))
        .block(Block::default().borders(Borders::ALL).title("Channels"));
    f.render_widget(channels, chunks[1]);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(chunks[2]);
    let buttons = Paragraph::new(button_lines(panel))
        .block(Block::default().borders(Borders::ALL).title("Buttons"));
    f.render_widget(buttons, middle[0]);
    let status = Paragraph::new(status_lines(panel))
        .block(Block::default().borders(Borders::ALL).title("Device"));
    f.render_widget(status, middle[1]);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[3]);
    let wifi = Paragraph::new(wifi_lines(&panel.wifi))
        .block(Block::default().borders(Borders::ALL).title("WiFi"));
    f.render_widget(wifi, bottom[0]);

    if state.show_info {
        let info = Paragraph::new(config_info_lines(config))
            .block(Block::default().borders(Borders::ALL).title("Configuration (Press 'i' to hide)"));
        f.render_widget(info, bottom[1]);
    } else {
        let visible = bottom[1].height.saturating_sub(2) as usize;
        let lines: Vec<Line> = log.tail(visible).into_iter().map(Line::from).collect();
        let events = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Events"));
        f.render_widget(events, bottom[1]);
    }

    let footer_text = match panel.channel(state.selected).and_then(|c| c.config.as_ref()) {
        Some(cfg) => format!(
            "Slot {} | {} | DMX ch {} | min {} max {} | dim {} auto {} hold {} ms",
            state.selected + 1,
            cfg.name,
            cfg.channel,
            cfg.min,
            cfg.max,
            cfg.dimming_speed,
            cfg.auto_dimming_speed,
            cfg.hold_period
        ),
        None => format!("Slot {} | waiting for device configuration", state.selected + 1),
    };
    let footer = Paragraph::new(footer_text).block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, chunks[4]);

    if panel.overlay_visible {
        let area = centered(f.size(), 40, 5);
        f.render_widget(Clear, area);
        let overlay = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                "Device not reachable",
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )),
        ])
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Red)));
        f.render_widget(overlay, area);
    }
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn level_bar(level: u8) -> String {
    let filled = (level as usize * BAR_WIDTH + 127) / 255;
    format!("[{}{}]", "█".repeat(filled), "·".repeat(BAR_WIDTH - filled))
}

fn channel_lines(panel: &PanelModel, selected: usize) -> Vec<Line<'static>> {
    panel
        .channels()
        .iter()
        .enumerate()
        .map(|(slot, view)| {
            let marker = if slot == selected { "▶" } else { " " };
            let (name, enabled) = match &view.config {
                Some(cfg) => (cfg.name.clone(), cfg.enabled),
                None => (String::from("-"), false),
            };
            let style = if !enabled {
                Style::default().fg(Color::DarkGray)
            } else if slot == selected {
                Style::default().add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::raw(format!("{} {} ", marker, slot + 1)),
                Span::styled(format!("{:<12}", name), style),
                Span::styled(level_bar(view.slider), Style::default().fg(Color::Yellow)),
                Span::raw(format!(" {:>3}", view.output)),
                Span::raw(if enabled { "" } else { "  (disabled)" }),
            ])
        })
        .collect()
}

fn button_lines(panel: &PanelModel) -> Vec<Line<'static>> {
    let mut lines = Vec::with_capacity(BUTTON_COUNT + 1);
    for slot in 0..BUTTON_COUNT {
        let Some(button) = panel.button(slot) else {
            continue;
        };
        let title = if button.name.is_empty() {
            format!("Button {}", slot + 1)
        } else {
            button.name.clone()
        };
        let state = if button.enabled { "on " } else { "off" };
        let output = if button.output.is_empty() { "-".to_string() } else { button.output.clone() };
        let style = if button.slider_disabled {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::raw(format!("{} {:<12} ", slot + 1, title)),
            Span::raw(format!("ch {:<4} {} ", button.channel, state)),
            Span::styled(output, style),
        ]));
    }

    let press = |id: &str| panel.element(id).map(|e| e.value.clone()).unwrap_or_default();
    lines.push(Line::from(format!(
        "press min {} ms / max {} ms",
        press("button_min_press"),
        press("button_max_press")
    )));
    lines
}

fn status_tag(panel: &PanelModel, label: &str, id: &str) -> Line<'static> {
    let (text, class) = panel
        .element(id)
        .map(|e| (e.html.clone(), e.class.clone()))
        .unwrap_or_default();
    let color = match class.as_str() {
        "tag is-success" => Color::Green,
        "tag is-danger" => Color::Red,
        _ => Color::DarkGray,
    };
    let text = if text.is_empty() { "-".to_string() } else { text };
    Line::from(vec![
        Span::raw(format!("{:<15}", label)),
        Span::styled(text, Style::default().fg(color)),
    ])
}

fn status_lines(panel: &PanelModel) -> Vec<Line<'static>> {
    let value = |id: &str| panel.element(id).map(|e| e.value.clone()).unwrap_or_default();
    vec![
        Line::from(format!("{:<15}{}", "Hostname", value("wifi_hostname"))),
        Line::from(format!("{:<15}{}", "SSID", value("wifi_ssid"))),
        Line::from(format!("{:<15}{}", "MQTT server", value("mqtt_server"))),
        status_tag(panel, "MQTT", "mqtt_status"),
        status_tag(panel, "Home Assistant", "home_assistant_status"),
        Line::from(format!("{:<15}{}", "Log level", value("log_level"))),
    ]
}

fn wifi_lines(wifi: &WifiView) -> Vec<Line<'static>> {
    match wifi {
        WifiView::Idle => vec![Line::from("Press 'w' to scan")],
        WifiView::Scanning => vec![Line::from("📡 Scanning...")],
        WifiView::Done(WifiScanOutcome::NoNetworksFound) => vec![Line::from("No networks found")],
        WifiView::Done(WifiScanOutcome::Failed(reason)) => {
            vec![Line::from(Span::styled(format!("❌ {}", reason), Style::default().fg(Color::Red)))]
        }
        WifiView::Done(WifiScanOutcome::Networks(networks)) => networks
            .iter()
            .map(|n| {
                let [ssid, rssi, channel, security] = n.row();
                Line::from(format!("{:<20} {:>8} {:>3} {}", ssid, rssi, channel, security))
            })
            .collect(),
    }
}

fn config_info_lines(config: &PanelConfig) -> Vec<Line<'static>> {
    let path = config
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    vec![
        Line::from(format!("Config file: {}", path)),
        Line::from(format!("Host: {}", config.host)),
        Line::from(format!("Reconnect delay: {} ms", config.reconnect_delay_ms)),
        Line::from(format!(
            "Probe: every {} ms, timeout {} ms",
            config.probe_interval_ms, config.probe_timeout_ms
        )),
        Line::from(format!("WiFi rescan delay: {} ms", config.wifi_rescan_delay_ms)),
        Line::from(format!("WiFi scan timeout: {} ms", config.wifi_scan_timeout_ms)),
        Line::from(format!("Slider step: {}", config.slider_step)),
        Line::from(format!("Log filter: {}", config.log_filter)),
    ]
}
