mod commands;
mod config;
mod console;
mod local_speech;
mod player;
mod upload;

use crate::commands::{Command, HELP};
use crate::config::Config;
use crate::console::{Transcript, format_messages, format_stages};
use crate::local_speech::CommandSpeech;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rulebook_core::chat::OpenAiChatClient;
use rulebook_core::ingest::PdfParser;
use rulebook_core::roster::{SessionRoster, create_session};
use rulebook_core::search::{RuleSearchClient, display_name};
use rulebook_core::session::{ExplanationSession, SendOutcome, SessionDeps};
use rulebook_core::settings::{AiProvider, SettingsStore};
use rulebook_core::speech::{CloudSpeech, CloudSpeechClient};
use rulebook_core::store::{DirStore, RulebookStore};
use rulebook_core::{LessonTrigger, SourceDocument};
use rulebook_types::Role;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::fmt::time::ChronoLocal;

const VOICE_INPUT_UNSUPPORTED: &str = "终端不支持语音输入，请直接输入文字提问。";

#[derive(Parser)]
#[command(version, about = "A board-game rules tutor for the terminal")]
struct Cli {
    /// Game to open on start: its list number or session id
    #[arg(long)]
    open: Option<String>,
}

enum Flow {
    Continue,
    Quit,
}

struct App {
    session: Arc<ExplanationSession>,
    store: Arc<dyn RulebookStore>,
    roster: Arc<SessionRoster>,
    settings: Arc<SettingsStore>,
    search: RuleSearchClient,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    // Logs go to stderr so they never interleave with the transcript.
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Configuration loaded. Data dir: {}", config.data_dir.display());

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();

    // --- 4. Build the session ---
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    let (app, mut events) = App::build(&config).await?;

    let mut transcript = Transcript::new();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(text) = transcript.render(&event) {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    // --- 5. Run ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match args.open {
        Some(target) => app.report(app.open(&target).await),
        None => app.report(app.list().await),
    }
    println!("输入 /help 查看命令。");

    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match app.handle(command, &mut lines).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => app.report::<()>(Err(e)),
        }
    }

    app.session.teardown();
    printer.abort();
    tracing::info!("Tutor closed");
    Ok(())
}

impl App {
    async fn build(
        config: &Config,
    ) -> Result<(Self, tokio::sync::mpsc::UnboundedReceiver<rulebook_core::SessionEvent>)> {
        let store: Arc<dyn RulebookStore> = Arc::new(DirStore::new(config.data_dir.join("library")));
        let roster = Arc::new(
            SessionRoster::open(config.data_dir.join("roster.json"))
                .await
                .context("Failed to open the game library")?,
        );
        let settings = Arc::new(SettingsStore::open(config.data_dir.join("settings.json")).await);

        let chat = OpenAiChatClient::new(settings.clone(), config.builtin_providers())
            .context("Failed to create chat client")?;
        let cloud_speech: Arc<dyn CloudSpeech> = Arc::new(
            CloudSpeechClient::new(config.cloud_speech())
                .context("Failed to create speech client")?,
        );
        let search = RuleSearchClient::new(config.rule_search_url.clone())
            .context("Failed to create rule search client")?;

        let (session, events) = ExplanationSession::new(SessionDeps {
            store: store.clone(),
            roster: roster.clone(),
            settings: settings.clone(),
            parser: Arc::new(PdfParser::new()),
            chat: Arc::new(chat),
            cloud_speech: cloud_speech.clone(),
            player: player::default_player(cloud_speech),
            local_speech: Arc::new(CommandSpeech::detect()),
        });

        let app = Self {
            session,
            store,
            roster,
            settings,
            search,
        };
        Ok((app, events))
    }

    fn report<T>(&self, result: Result<T>) {
        if let Err(e) = result {
            tracing::error!("{:#}", e);
            println!("出错了：{e:#}");
        }
    }

    async fn handle(
        &self,
        command: Command,
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> Result<Flow> {
        match command {
            Command::Help => println!("{HELP}"),
            Command::Stages => println!("{}", format_stages()),
            Command::Quit => return Ok(Flow::Quit),
            Command::List => self.list().await?,
            Command::Add(path) => {
                let (name, document) = upload::read_source(&path).await?;
                self.add(&name, document).await?;
            }
            Command::Open(target) => self.open(&target).await?,
            Command::Rename(name) => {
                self.session.rename_session(&name).await?;
                println!("已重命名为《{}》", self.session.session_name());
            }
            Command::Delete => self.delete(lines).await?,
            Command::Trigger(trigger) => self.send(trigger),
            Command::Ask(question) => self.ask(question),
            Command::Messages => println!("{}", format_messages(&self.session.messages())),
            Command::Play(position) => self.play(position)?,
            Command::Stop => self.session.stop_audio(),
            Command::Clear => self.session.clear_messages().await,
            Command::Settings => self.show_settings().await,
            Command::SetProvider(provider) => self.settings.set_provider(provider).await?,
            Command::SetCustomProvider {
                base_url,
                api_key,
                model,
            } => {
                self.settings
                    .set_custom_provider(&base_url, &api_key, &model)
                    .await?;
                self.settings.set_provider(AiProvider::Custom).await?;
            }
            Command::SetEngine(engine) => self.settings.set_engine(engine).await?,
            Command::SetVoice(voice) => self.settings.set_voice(voice).await?,
            Command::SetAutoPlay(on) => self.settings.set_auto_play(on).await?,
            Command::SetRate(rate) => self.settings.set_speech_rate(rate).await?,
            Command::Search(name) => self.search(&name).await?,
            Command::Fetch(position) => self.fetch(position).await?,
            Command::Microphone => println!("{VOICE_INPUT_UNSUPPORTED}"),
        }
        Ok(Flow::Continue)
    }

    async fn list(&self) -> Result<()> {
        let games = self.roster.list().await;
        if games.is_empty() {
            println!("游戏库是空的。用 /add 添加规则书，或用 /search 在线查找。");
            return Ok(());
        }
        let current = self.session.session_id();
        for (i, game) in games.iter().enumerate() {
            let marker = if current.as_deref() == Some(game.id.as_str()) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker}{:>3}. {}  (最近使用 {})",
                i + 1,
                game.name,
                game.last_active_at.format("%Y-%m-%d %H:%M")
            );
        }
        Ok(())
    }

    async fn open(&self, target: &str) -> Result<()> {
        let games = self.roster.list().await;
        let game = target
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| games.get(i))
            .or_else(|| games.iter().find(|g| g.id == target || g.name == target))
            .ok_or_else(|| anyhow!("没有找到游戏 {target:?}"))?;

        self.session.teardown();
        self.session.load(&game.id).await?;
        println!("已打开《{}》", game.name);
        let messages = self.session.messages();
        if !messages.is_empty() {
            println!("{}", format_messages(&messages));
        }
        Ok(())
    }

    async fn add(&self, name: &str, document: SourceDocument) -> Result<()> {
        let meta = create_session(&self.roster, self.store.as_ref(), name, document).await?;
        println!("已添加《{}》", meta.name);
        self.open(&meta.id).await
    }

    async fn delete(&self, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
        if self.session.session_id().is_none() {
            println!("请先用 /open 打开一个游戏");
            return Ok(());
        }
        println!(
            "确定删除《{}》及其全部对话吗？输入 y 确认：",
            self.session.session_name()
        );
        let answer = lines.next_line().await?.unwrap_or_default();
        if answer.trim().eq_ignore_ascii_case("y") {
            self.session.delete_session().await?;
            println!("已删除");
            self.list().await?;
        } else {
            println!("已取消");
        }
        Ok(())
    }

    fn send(&self, trigger: LessonTrigger) {
        let session = self.session.clone();
        tokio::spawn(async move {
            let outcome = session.send_trigger(trigger).await;
            explain_outcome(outcome);
        });
    }

    fn ask(&self, question: String) {
        let session = self.session.clone();
        tokio::spawn(async move {
            let outcome = session.send_message(&question, false, false).await;
            explain_outcome(outcome);
        });
    }

    fn play(&self, position: usize) -> Result<()> {
        let messages = self.session.messages();
        let message = messages
            .get(position - 1)
            .ok_or_else(|| anyhow!("没有第 {position} 条消息"))?;
        if message.role != Role::Assistant {
            println!("只能朗读导师的回答");
            return Ok(());
        }
        let session = self.session.clone();
        let id = message.id;
        tokio::spawn(async move { session.play_message_audio(id).await });
        Ok(())
    }

    async fn show_settings(&self) {
        let settings = self.settings.snapshot().await;
        let provider = match settings.ai.model_type {
            AiProvider::Gemini => "gemini".to_string(),
            AiProvider::Claude => "claude".to_string(),
            AiProvider::Custom => format!(
                "custom ({} · {})",
                settings.ai.custom_base_url, settings.ai.custom_model_name
            ),
        };
        println!("模型:     {provider}");
        println!("语音引擎: {:?}", settings.tts.engine);
        println!("音色:     {}", settings.tts.voice.wire_name());
        println!("自动朗读: {}", if settings.tts.auto_play { "开" } else { "关" });
        println!("语速:     {}x", settings.tts.speech_rate);
    }

    async fn search(&self, name: &str) -> Result<()> {
        let results = self.search.search(name).await?;
        self.roster.set_last_search(name.trim(), results.clone()).await?;
        if results.is_empty() {
            println!("没有找到相关规则书");
            return Ok(());
        }
        for (i, url) in results.iter().enumerate() {
            println!("{:>3}. {}", i + 1, display_name(url));
        }
        println!("用 /fetch <编号> 添加到游戏库");
        Ok(())
    }

    async fn fetch(&self, position: usize) -> Result<()> {
        let last = self.roster.last_search().await;
        let url = last
            .results
            .get(position - 1)
            .ok_or_else(|| anyhow!("上次搜索没有第 {position} 个结果"))?;
        println!("正在下载 {} …", display_name(url));
        let bytes = self.search.fetch_document(url).await?;
        self.add(&display_name(url), SourceDocument::Pdf(bytes)).await
    }
}

fn explain_outcome(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Busy => println!("导师还在回答，请稍候"),
        SendOutcome::NoContent => println!("这个游戏还没有可用的规则内容"),
        SendOutcome::Inactive => println!("请先用 /open 打开一个游戏"),
        SendOutcome::Completed | SendOutcome::Failed => {}
    }
}
