use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{HelixClient, TwitchApi};
use crate::config::AppConfig;
use crate::internal::auth::{AuthPhase, AuthSettings, SystemClock, TokenManager};
use crate::internal::models::{SearchResult, TrackedChannel};
use crate::internal::notification::{ChannelSink, Notification, NotificationLog};
use crate::internal::persist::{FileBlobStore, Persister};
use crate::internal::query_cache::QueryCache;
use crate::internal::redirect::BrowserRedirect;
use crate::internal::search::{ChannelSearch, SearchError, empty_state_message, is_searchable};
use crate::internal::status::{ChannelStatusPoller, StatusSnapshot};
use crate::internal::tracked::TrackedChannelStore;
use crate::utils::debounce::debounce;

const HELP: &str = "\
Commands:
  login                  open the Twitch authorization page
  callback <url>         paste the url the browser landed on after login
  logout                 forget the current session
  whoami                 show the logged in user
  search <term>          look up channels (empty term clears)
  add <n>                track result n of the last search
  track <id> <name>      track a channel by id
  remove <id>            stop tracking a channel
  move <id> <target id>  move a channel to the position of another
  list                   show tracked channels with live status
  notifications          show recent messages that have not timed out
  help                   show this help
  quit                   exit";

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login,
    /// The url the browser landed on after authorizing.
    Callback(String),
    Logout,
    WhoAmI,
    Search(String),
    /// 1-based row of the last search results.
    Add(usize),
    Track { id: String, display_name: String },
    Remove(String),
    Move { active_id: String, over_id: String },
    List,
    Notifications,
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let command = match name {
            "" => return Ok(None),
            "login" => Self::Login,
            "callback" => {
                if rest.is_empty() {
                    bail!("usage: callback <url>");
                }
                Self::Callback(rest.to_string())
            }
            "logout" => Self::Logout,
            "whoami" => Self::WhoAmI,
            "search" | "s" => Self::Search(rest.to_string()),
            "add" => {
                let index = rest
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .context("usage: add <result number>")?;
                Self::Add(index)
            }
            "track" => {
                let (id, display_name) = rest
                    .split_once(char::is_whitespace)
                    .context("usage: track <id> <display name>")?;
                Self::Track {
                    id: id.to_string(),
                    display_name: display_name.trim().to_string(),
                }
            }
            "remove" | "rm" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    bail!("usage: remove <id>");
                }
                Self::Remove(rest.to_string())
            }
            "move" | "mv" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next(), args.next()) {
                    (Some(active_id), Some(over_id), None) => Self::Move {
                        active_id: active_id.to_string(),
                        over_id: over_id.to_string(),
                    },
                    _ => bail!("usage: move <id> <target id>"),
                }
            }
            "list" | "ls" => Self::List,
            "notifications" | "n" => Self::Notifications,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => bail!("unknown command \"{}\", type help", other),
        };
        Ok(Some(command))
    }
}

/// Messages delivered to the main loop.
#[derive(Debug)]
pub enum Action {
    Input(String),
    InputClosed,
    SearchFinished {
        term: String,
        results: Vec<SearchResult>,
    },
    SearchFailed {
        term: String,
        message: String,
    },
}

/// One line of the channel list.
pub fn format_channel_line(position: usize, tracked: &TrackedChannel, status: &StatusSnapshot) -> String {
    let state = match status.channels.get(&tracked.id) {
        Some(channel) if channel.is_online => match channel.viewer_count {
            Some(viewers) => format!("live, {} viewers", viewers),
            None => "live".to_string(),
        },
        Some(_) => "offline".to_string(),
        None => "...".to_string(),
    };
    format!("{:>3}. {:<25} {:<12} {}", position, tracked.display_name, tracked.id, state)
}

/// Line-oriented host wiring every component together.
pub struct App {
    pub running: bool,
    pub config: AppConfig,
    cache: Arc<QueryCache>,
    persister: Arc<Persister>,
    redirect: Arc<BrowserRedirect>,
    tokens: Arc<TokenManager>,
    tracked: Arc<TrackedChannelStore>,
    search: Arc<ChannelSearch>,
    poller: Arc<ChannelStatusPoller>,
    search_term: watch::Sender<String>,
    search_results: Vec<SearchResult>,
    last_status_error: Option<String>,
    notifications: UnboundedReceiver<Notification>,
    recent: NotificationLog,
    pub action_tx: UnboundedSender<Action>,
    pub action_rx: UnboundedReceiver<Action>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(QueryCache::with_metrics(config.enable_cache_metrics));

        let blobs = FileBlobStore::open(config.data_dir.as_deref().map(Path::new))?;
        let persister = Arc::new(Persister::new(Arc::new(blobs), Arc::clone(&cache)));

        let api: Arc<dyn TwitchApi> = Arc::new(HelixClient::with_base_urls(
            config.client_id.clone(),
            config.helix_base_url.clone(),
            config.id_base_url.clone(),
        ));
        let redirect = Arc::new(BrowserRedirect::default());
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            redirect.clone(),
            Arc::new(SystemClock),
            AuthSettings::from_config(&config),
            persister.restoring(),
        ));

        let (sink, notifications) = ChannelSink::new();
        let tracked = Arc::new(TrackedChannelStore::new(Arc::clone(&cache), Arc::new(sink)));
        let search = Arc::new(ChannelSearch::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            config.search_stale_time(),
        ));
        let poller = Arc::new(ChannelStatusPoller::new(
            api,
            Arc::clone(&cache),
            config.poll_interval(),
        ));
        let (search_term, _) = watch::channel(String::new());

        tracing::info!(
            helix = %config.helix_base_url,
            redirect_uri = %config.redirect_uri(),
            poll_interval = ?config.poll_interval(),
            "app configured"
        );

        Ok(Self {
            running: true,
            config,
            cache,
            persister,
            redirect,
            tokens,
            tracked,
            search,
            poller,
            search_term,
            search_results: Vec::new(),
            last_status_error: None,
            notifications,
            recent: NotificationLog::default(),
            action_tx,
            action_rx,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.persister.restore();
        let phase = self.tokens.initialize().await;
        self.print_phase(phase);
        println!("{}", HELP);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks: Vec<JoinHandle<()>> = vec![
            self.persister.spawn_sync(shutdown_rx.clone()),
            self.tokens.spawn_cache_sync(shutdown_rx.clone()),
            tokio::spawn(Arc::clone(&self.poller).run(shutdown_rx.clone())),
        ];
        self.spawn_input_reader();

        let mut debounced = debounce(self.search_term.subscribe(), self.config.search_debounce());
        let mut status = self.poller.subscribe();

        while self.running {
            tokio::select! {
                Some(action) = self.action_rx.recv() => self.handle_action(action).await,
                Some(notification) = self.notifications.recv() => self.show(notification),
                changed = debounced.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let term = debounced.borrow_and_update().clone();
                    self.spawn_search(term);
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = status.borrow_and_update().clone();
                    self.report_status(&snapshot);
                }
            }
        }

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.persister.persist_tracked_channels();
        self.persister.persist_auth_session();
        info!("shut down");
        Ok(())
    }

    /// Stdin is read on a plain thread: a blocked read must not hold up runtime shutdown.
    fn spawn_input_reader(&self) {
        let tx = self.action_tx.clone();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(Action::Input(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
            let _ = tx.send(Action::InputClosed);
        });
    }

    fn spawn_search(&self, term: String) {
        if term.is_empty() {
            return;
        }
        let search = Arc::clone(&self.search);
        let access_token = self.tokens.access_token();
        let tx = self.action_tx.clone();
        tokio::spawn(async move {
            let action = match search.search(&term, access_token.as_deref()).await {
                Ok(results) => Action::SearchFinished { term, results },
                Err(SearchError::Superseded) => return,
                Err(e) => Action::SearchFailed {
                    term,
                    message: e.to_string(),
                },
            };
            let _ = tx.send(action);
        });
    }

    async fn handle_action(&mut self, action: Action) {
        match action {
            Action::Input(line) => match Command::parse(&line) {
                Ok(Some(command)) => self.handle_command(command).await,
                Ok(None) => {}
                Err(e) => println!("{}", e),
            },
            Action::InputClosed => self.running = false,
            Action::SearchFinished { term, results } => {
                if *self.search_term.borrow() != term {
                    return;
                }
                self.search_results = results;
                self.print_search_results(&term);
            }
            Action::SearchFailed { term, message } => {
                if *self.search_term.borrow() == term {
                    self.search_results.clear();
                    println!("{}", message);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Login => match self.tokens.authorize_url() {
                Ok(url) => {
                    println!("Authorize in your browser: {}", url);
                    println!("Then paste the address you land on with: callback <url>");
                    if let Err(e) = self.tokens.login() {
                        warn!(error = ?e, "could not open a browser");
                    }
                }
                Err(e) => println!("Cannot build the authorization url: {:#}", e),
            },
            Command::Callback(raw) => match Url::parse(&raw) {
                Ok(url) => {
                    self.redirect.land(url);
                    let phase = self.tokens.initialize().await;
                    self.print_phase(phase);
                }
                Err(e) => println!("Not a url: {}", e),
            },
            Command::Logout => {
                self.tokens.logout();
                self.search_results.clear();
                println!("Logged out.");
            }
            Command::WhoAmI => self.print_phase(self.tokens.phase()),
            Command::Search(term) => {
                if !self.tokens.is_authenticated() {
                    println!("Log in to search channels.");
                    return;
                }
                if self.tracked.is_full() {
                    println!("{}", crate::internal::tracked::MAX_CHANNELS_MESSAGE);
                    return;
                }
                self.cache
                    .cleanup_older_than(self.config.search_stale_time() * 2);
                if !term.is_empty() && !is_searchable(&term) {
                    println!("{}", empty_state_message(&term, 0, false));
                }
                self.search_term.send_replace(term);
            }
            Command::Add(index) => {
                let Some(result) = self.search_results.get(index - 1) else {
                    println!("No search result #{}.", index);
                    return;
                };
                let channel = result.as_tracked();
                self.tracked.add(channel).await;
                self.search_results.clear();
                self.search_term.send_replace(String::new());
            }
            Command::Track { id, display_name } => {
                self.tracked.add(TrackedChannel::new(id, display_name)).await;
            }
            Command::Remove(id) => {
                let name = self
                    .tracked
                    .channels()
                    .into_iter()
                    .find(|c| c.id == id)
                    .map(|c| c.display_name);
                self.tracked.remove(&id, name.as_deref()).await;
            }
            Command::Move { active_id, over_id } => {
                self.tracked.reorder(&active_id, &over_id).await;
            }
            Command::List => self.print_channels(),
            Command::Notifications => self.print_notifications(),
            Command::Help => println!("{}", HELP),
            Command::Quit => self.running = false,
        }
    }

    fn print_phase(&self, phase: AuthPhase) {
        match (phase, self.tokens.user()) {
            (AuthPhase::LoggedIn, Some(user)) => println!("Logged in as {}.", user.display_name),
            (AuthPhase::PendingValidation, _) => println!("Validating session..."),
            (AuthPhase::Restoring, _) => println!("Restoring session..."),
            _ => println!("Not logged in. Type login to connect your Twitch account."),
        }
    }

    fn print_search_results(&self, term: &str) {
        if self.search_results.is_empty() {
            println!(
                "{}",
                empty_state_message(term, 0, self.search.is_fetching(term))
            );
            return;
        }
        for (i, result) in self.search_results.iter().enumerate() {
            let tracked = match self.tracked.contains(&result.id) {
                true => " (tracked)",
                false => "",
            };
            let live = match result.is_online {
                true => "live",
                false => "offline",
            };
            println!("{:>3}. {} [{}]{}", i + 1, result.display_name, live, tracked);
        }
    }

    fn print_channels(&self) {
        let channels = self.tracked.channels();
        if channels.is_empty() {
            println!("No channels tracked yet. Use search and add.");
            return;
        }
        let snapshot = self.poller.snapshot();
        for (i, channel) in channels.iter().enumerate() {
            println!("{}", format_channel_line(i + 1, channel, &snapshot));
        }
        if let Some(error) = &snapshot.error {
            println!("Live status may be outdated: {}", error);
        }
    }

    fn show(&mut self, notification: Notification) {
        println!("[{}] {}", notification.notification_type, notification.message);
        self.recent.push(notification);
    }

    fn print_notifications(&mut self) {
        let active = self.recent.active();
        if active.is_empty() {
            println!("No recent notifications.");
            return;
        }
        for notification in active {
            println!(
                "[{}] {} ({}s)",
                notification.notification_type,
                notification.message,
                notification.remaining_time().as_secs()
            );
        }
    }

    fn report_status(&mut self, snapshot: &StatusSnapshot) {
        if snapshot.error != self.last_status_error {
            if let Some(error) = &snapshot.error {
                self.show(Notification::warning(format!(
                    "Failed to refresh live status: {}",
                    error
                )));
            }
            self.last_status_error = snapshot.error.clone();
        }
    }
}
