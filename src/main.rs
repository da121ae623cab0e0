mod attachment;
mod backend;
mod config;
mod error;
mod markdown;
mod notify;
mod request;
mod reveal;
mod session;
mod timeline;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::Engine;
use iced::{
    alignment,
    event::{self, Event as IcedEvent},
    font,
    keyboard::{self, Key},
    time,
    widget::{button, column, container, row, scrollable, text, text_input, Column},
    window, Element, Font, Length, Padding, Subscription, Task, Theme,
};
use tracing_subscriber::EnvFilter;

use crate::attachment::ImageUpload;
use crate::backend::BackendClient;
use crate::error::MaterializeError;
use crate::markdown::{Block, BlockKind};
use crate::notify::Banner;
use crate::request::{RequestOutcome, RequestToken};
use crate::session::{Outbound, Phase, Session};
use crate::timeline::{Product, TimelineEntry};

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::load();
    let backend = BackendClient::with_config(&config.backend)?;
    tracing::info!(backend = %backend.base_url(), "starting commerce chat");

    let window_size = iced::Size::new(config.window.width as f32, config.window.height as f32);

    iced::application("AI Commerce Assistant", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window::Settings {
            size: window_size,
            position: window::Position::Centered,
            ..Default::default()
        })
        .run_with(move || App::new(config, backend))
        .context("Failed to run application")
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    AttachPathChanged(String),
    Attach,
    Attached(Result<ImageUpload, Arc<MaterializeError>>),
    ResponseReceived(RequestToken, RequestOutcome),
    RevealTick,
    SpinnerTick,
    Stop,
    ResetMemory,
    BannerTick(Instant),
    DismissBanner,
    ToggleTheme,
}

struct App {
    config: config::Config,
    session: Session,
    backend: BackendClient,
    input_text: String,
    attach_path: String,
    attaching: bool,
    // Decoded previews by timeline index, filled when the image is sent. `view` falls
    // back to decoding the entry's own preview URI, so a missing key only costs time.
    previews: HashMap<usize, iced::widget::image::Handle>,
    banner: Option<Banner>,
    loading_frame: usize,
    dark_mode: bool,
    input_id: text_input::Id,
    scroll_id: scrollable::Id,
}

impl App {
    fn new(config: config::Config, backend: BackendClient) -> (Self, Task<Message>) {
        let input_id = text_input::Id::unique();
        let session = Session::new(config.reveal.interval());

        let app = App {
            config,
            session,
            backend,
            input_text: String::new(),
            attach_path: String::new(),
            attaching: false,
            previews: HashMap::new(),
            banner: None,
            loading_frame: 0,
            dark_mode: true,
            input_id: input_id.clone(),
            scroll_id: scrollable::Id::unique(),
        };

        (app, text_input::focus(input_id))
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        let task = match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                // The pending upload would be refused once the text request starts.
                if self.attaching {
                    tracing::debug!("ignoring submit while an attachment is being read");
                    return Task::none();
                }
                match self.session.send_text(&self.input_text) {
                    Some(outbound) => {
                        self.input_text.clear();
                        Task::batch([self.dispatch(outbound), self.scroll_to_end()])
                    }
                    None => Task::none(),
                }
            }
            Message::AttachPathChanged(value) => {
                self.attach_path = value;
                Task::none()
            }
            Message::Attach => {
                let path = self.attach_path.trim();
                if path.is_empty() || self.attaching || self.session.is_busy() {
                    return Task::none();
                }
                self.attaching = true;
                let path = PathBuf::from(path);
                Task::future(async move {
                    Message::Attached(attachment::materialize(&path).await.map_err(Arc::new))
                })
            }
            Message::Attached(result) => {
                self.attaching = false;
                match result {
                    Ok(upload) => {
                        let preview = iced::widget::image::Handle::from_bytes(upload.bytes.clone());
                        match self.session.send_image(upload) {
                            Some(outbound) => {
                                let index = self.session.snapshot().entries.len().saturating_sub(1);
                                self.previews.insert(index, preview);
                                self.attach_path.clear();
                                Task::batch([self.dispatch(outbound), self.scroll_to_end()])
                            }
                            None => {
                                tracing::warn!(
                                    path = %self.attach_path,
                                    "session busy, attachment not sent"
                                );
                                Task::none()
                            }
                        }
                    }
                    Err(e) => {
                        self.session.report_attachment_failure(&e);
                        Task::none()
                    }
                }
            }
            Message::ResponseReceived(token, outcome) => {
                self.session.on_result(token, outcome);
                self.scroll_to_end()
            }
            Message::RevealTick => {
                self.session.on_reveal_tick();
                if self.session.phase() == Phase::Idle {
                    self.scroll_to_end()
                } else {
                    Task::none()
                }
            }
            Message::SpinnerTick => {
                self.loading_frame = (self.loading_frame + 1) % SPINNER_FRAMES.len();
                Task::none()
            }
            Message::Stop => {
                self.session.stop();
                Task::none()
            }
            Message::ResetMemory if self.attaching => Task::none(),
            Message::ResetMemory => match self.session.reset_memory() {
                Some(outbound) => self.dispatch(outbound),
                None => Task::none(),
            },
            Message::BannerTick(now) => {
                if self.banner.as_ref().is_some_and(|banner| banner.is_expired(now)) {
                    self.banner = None;
                }
                Task::none()
            }
            Message::DismissBanner => {
                self.banner = None;
                Task::none()
            }
            Message::ToggleTheme => {
                self.dark_mode = !self.dark_mode;
                Task::none()
            }
        };

        Task::batch([task, self.surface_notice()])
    }

    fn dispatch(&self, outbound: Outbound) -> Task<Message> {
        let backend = self.backend.clone();
        let Outbound { ticket, request } = outbound;

        Task::future(async move {
            let outcome = backend.dispatch(request, ticket.cancel).await;
            Message::ResponseReceived(ticket.token, outcome)
        })
    }

    fn scroll_to_end(&self) -> Task<Message> {
        scrollable::snap_to(self.scroll_id.clone(), scrollable::RelativeOffset::END)
    }

    /// Move a pending session notice into the banner and, if enabled, the desktop.
    fn surface_notice(&mut self) -> Task<Message> {
        let Some(notice) = self.session.take_notice() else {
            return Task::none();
        };
        self.banner = Some(Banner::new(&notice));

        if !self.config.notifications.desktop {
            return Task::none();
        }

        Task::future(async move {
            match tokio::task::spawn_blocking(move || notify::show_desktop(&notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{:#}", e),
                Err(e) => tracing::warn!("notification task failed: {}", e),
            }
        })
        .discard()
    }

    fn subscription(&self) -> Subscription<Message> {
        let reveal = if self.session.phase() == Phase::Revealing {
            time::every(self.session.reveal_interval()).map(|_| Message::RevealTick)
        } else {
            Subscription::none()
        };

        let spinner = if self.session.phase() == Phase::AwaitingResponse {
            time::every(Duration::from_millis(80)).map(|_| Message::SpinnerTick)
        } else {
            Subscription::none()
        };

        let banner = if self.banner.is_some() {
            time::every(Duration::from_millis(250)).map(Message::BannerTick)
        } else {
            Subscription::none()
        };

        let events = event::listen_with(|event, _status, _id| {
            if let IcedEvent::Keyboard(keyboard::Event::KeyPressed {
                key: Key::Named(keyboard::key::Named::Escape),
                ..
            }) = event
            {
                Some(Message::Stop)
            } else {
                None
            }
        });

        Subscription::batch([reveal, spinner, banner, events])
    }

    fn view(&self) -> Element<Message> {
        let snapshot = self.session.snapshot();
        let busy = snapshot.phase != Phase::Idle;
        let can_send = !busy && !self.attaching;

        let header = row![
            text("AI Commerce Assistant").size(20).width(Length::Fill),
            button(text("Reset memory").size(14))
                .on_press_maybe(can_send.then_some(Message::ResetMemory))
                .padding(8),
            button(text(if self.dark_mode { "Light" } else { "Dark" }).size(14))
                .on_press(Message::ToggleTheme)
                .padding(8),
        ]
        .spacing(10)
        .align_y(alignment::Vertical::Center);

        let mut timeline = Column::new().spacing(10).padding(15);
        for (index, entry) in snapshot.entries.iter().enumerate() {
            timeline = timeline.push(self.view_entry(index, entry));
        }
        if snapshot.phase == Phase::AwaitingResponse {
            timeline = timeline.push(
                text(format!("{} Thinking...", SPINNER_FRAMES[self.loading_frame])).size(15),
            );
        }

        let history = scrollable(timeline)
            .id(self.scroll_id.clone())
            .height(Length::Fill);

        let mut input = text_input("Ask about products...", &self.input_text)
            .padding(12)
            .size(16)
            .id(self.input_id.clone());
        if !busy {
            input = input.on_input(Message::InputChanged);
        }
        if can_send {
            input = input.on_submit(Message::Submit);
        }

        let action = match busy {
            true => button(text("Stop").size(14)).on_press(Message::Stop),
            false => button(text("Send").size(14)).on_press_maybe(can_send.then_some(Message::Submit)),
        };

        let mut attach_input = text_input("Image path to search by...", &self.attach_path)
            .padding(8)
            .size(14);
        let can_attach = !busy && !self.attaching;
        if can_attach {
            attach_input = attach_input
                .on_input(Message::AttachPathChanged)
                .on_submit(Message::Attach);
        }
        let attach_button = button(text(if self.attaching { "Reading..." } else { "Attach" }).size(14))
            .on_press_maybe(can_attach.then_some(Message::Attach))
            .padding(8);

        let mut content = column![header, history].spacing(10).padding(10);

        if let Some(banner) = &self.banner {
            content = content.push(
                container(
                    row![
                        text(banner.message.clone()).size(14).width(Length::Fill),
                        button(text("×").size(14))
                            .on_press(Message::DismissBanner)
                            .padding(4),
                    ]
                    .align_y(alignment::Vertical::Center),
                )
                .padding(Padding::from([8, 12]))
                .width(Length::Fill)
                .style(container::rounded_box),
            );
        }

        content = content
            .push(row![input, action.padding(12)].spacing(10))
            .push(row![attach_input, attach_button].spacing(10));

        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn view_entry<'a>(&'a self, index: usize, entry: &'a TimelineEntry) -> Element<'a, Message> {
        match entry {
            TimelineEntry::UserText { text: body } => {
                bubble(text(body.as_str()).size(15).into(), true)
            }
            TimelineEntry::UserImage { preview_uri } => {
                let handle = self
                    .previews
                    .get(&index)
                    .cloned()
                    .or_else(|| preview_from_data_uri(preview_uri));
                let preview: Element<Message> = match handle {
                    Some(handle) => iced::widget::image(handle)
                        .width(Length::Fixed(220.0))
                        .into(),
                    None => text("[image]").size(15).into(),
                };
                bubble(preview, true)
            }
            TimelineEntry::AssistantText { text: body, streaming } => {
                let mut blocks = markdown::flatten(body)
                    .into_iter()
                    .map(view_block)
                    .collect::<Vec<_>>();
                if *streaming {
                    blocks.push(text("▍").size(15).into());
                }
                bubble(Column::with_children(blocks).spacing(6).into(), false)
            }
            TimelineEntry::ProductRef { product } => self.view_product(product),
        }
    }

    fn view_product<'a>(&'a self, product: &'a Product) -> Element<'a, Message> {
        let bold = Font {
            weight: font::Weight::Bold,
            ..Font::DEFAULT
        };
        let caption = |label: &str, value: String| text(format!("{}: {}", label, value)).size(12);

        let card = column![
            text(product.name.as_str()).size(18).font(bold),
            text(product.description.as_str()).size(14),
            caption("Category", product.category.clone()),
            caption("Tags", product.tags.join(", ")),
            caption("Use Cases", product.use_cases.join(", ")),
            caption("Features", product.features.join(", ")),
            text(format!("Price: {}", product.price_label())).size(15).font(bold),
            text(product.image_url(self.backend.base_url())).size(11),
        ]
        .spacing(4);

        container(card)
            .padding(12)
            .width(Length::Fill)
            .style(container::rounded_box)
            .into()
    }

    fn theme(&self) -> Theme {
        if self.dark_mode {
            Theme::TokyoNight
        } else {
            Theme::Light
        }
    }
}

fn bubble(content: Element<Message>, from_user: bool) -> Element<Message> {
    let inner = container(content)
        .padding(12)
        .max_width(600.0)
        .style(container::rounded_box);

    container(inner)
        .width(Length::Fill)
        .align_x(if from_user {
            alignment::Horizontal::Right
        } else {
            alignment::Horizontal::Left
        })
        .into()
}

/// Decode a `data:<mime>;base64,<payload>` preview into an image handle.
fn preview_from_data_uri(uri: &str) -> Option<iced::widget::image::Handle> {
    let (_, payload) = uri.strip_prefix("data:")?.split_once(";base64,")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| tracing::warn!("undecodable image preview: {}", e))
        .ok()?;
    Some(iced::widget::image::Handle::from_bytes(bytes))
}

fn view_block(block: Block) -> Element<'static, Message> {
    match block.kind {
        BlockKind::Heading(level) => text(block.text)
            .size(match level {
                1 => 22,
                2 => 19,
                _ => 17,
            })
            .font(Font {
                weight: font::Weight::Bold,
                ..Font::DEFAULT
            })
            .into(),
        BlockKind::ListItem { depth, marker } => row![
            text(format!("{}{}", "    ".repeat(depth), marker)).size(15),
            text(block.text).size(15),
        ]
        .spacing(6)
        .into(),
        BlockKind::Code => container(text(block.text).size(14).font(Font::MONOSPACE))
            .padding(8)
            .style(container::bordered_box)
            .into(),
        BlockKind::Rule => text("────────").size(12).into(),
        BlockKind::Paragraph => text(block.text).size(15).into(),
    }
}
