//! Session manager.
//!
//! One actor task owns the device handle, the epoch counter, the callers
//! waiting on an in-flight resolution and the telemetry armed for the
//! current handle. [`Session`] is the cloneable front end talking to it
//! over a command channel.
//!
//! Every resolution is tagged with the epoch current when it started. The
//! epoch moves on when the options are replaced or the handle is lost, and
//! completions from an older epoch are discarded.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bean::Bean;
use crate::color::{ColorMessage, Rgb};
use crate::error::SessionError;
use crate::plugin::{Event, Options};
use crate::poller::Armed;
use crate::telemetry;
use crate::transport::{self, Radio, Target};

const BLINK: Duration = Duration::from_secs(2);

type Reply = oneshot::Sender<Result<Bean, SessionError>>;

enum Command {
    Configure(Options),
    Bean(Reply),
    Resolved {
        epoch: u64,
        result: Result<Bean, SessionError>,
    },
    Lost {
        epoch: u64,
    },
    Close(oneshot::Sender<()>),
}

/// Handle to the session manager task.
#[derive(Clone)]
pub struct Session {
    commands: UnboundedSender<Command>,
    events: UnboundedSender<Event>,
}

impl Session {
    /// Start an idle manager. Nothing happens until [`Session::configure`].
    pub fn spawn(radio: Arc<dyn Radio>, events: UnboundedSender<Event>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let manager = Manager::new(radio, events.clone(), commands.downgrade());
        tokio::spawn(manager.run(receiver));
        Session { commands, events }
    }

    /// Replace the options, releasing the current device.
    pub fn configure(&self, options: Options) {
        let _ = self.commands.send(Command::Configure(options));
    }

    /// The current device, resolving it first if needed.
    pub async fn bean(&self) -> Result<Bean, SessionError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Bean(reply))
            .map_err(|_| SessionError::Closed)?;
        result.await.map_err(|_| SessionError::Closed)?
    }

    /// Write a color to the device in the background. Failures become
    /// error events.
    pub fn send_color(&self, message: ColorMessage) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.write_color(&message).await {
                error!("Error getting the bean: {}", e);
                // Resolution failures were already reported by the manager.
                if !e.is_resolution() {
                    let _ = session.events.send(Event::Error(e.to_string()));
                }
            }
        });
    }

    pub async fn write_color(&self, message: &ColorMessage) -> Result<(), SessionError> {
        let bean = self.bean().await?;
        let Some(rgb) = message.rgb() else {
            return Ok(());
        };
        bean.set_color(rgb)
            .await
            .map_err(|e| SessionError::WriteFailure(e.to_string()))
    }

    /// Release the device and stop the manager.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close(reply)).is_ok() {
            let _ = done.await;
        }
    }
}

struct Manager {
    radio: Arc<dyn Radio>,
    events: UnboundedSender<Event>,
    // Weak so that dropping every Session stops the manager.
    commands: WeakUnboundedSender<Command>,
    options: Options,
    epoch: u64,
    bean: Option<Bean>,
    /// Some while a resolution is in flight.
    waiters: Option<Vec<Reply>>,
    /// The in-flight resolution, aborted when the epoch moves on.
    resolution: Option<JoinHandle<()>>,
    /// Resolves once every device released so far is disconnected.
    released: Option<Shared<BoxFuture<'static, ()>>>,
    /// Superseded handles held until the in-flight resolution settles.
    stale: Vec<Bean>,
    armed: Vec<Armed>,
}

impl Manager {
    fn new(
        radio: Arc<dyn Radio>,
        events: UnboundedSender<Event>,
        commands: WeakUnboundedSender<Command>,
    ) -> Self {
        Manager {
            radio,
            events,
            commands,
            options: Options::default(),
            epoch: 0,
            bean: None,
            waiters: None,
            resolution: None,
            released: None,
            stale: Vec::new(),
            armed: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Configure(options) => self.configure(options),
                Command::Bean(reply) => self.request(reply),
                Command::Resolved { epoch, result } => self.resolved(epoch, result),
                Command::Lost { epoch } => self.lost(epoch),
                Command::Close(done) => {
                    self.advance();
                    self.release();
                    for bean in std::mem::take(&mut self.stale) {
                        self.disconnect(bean);
                    }
                    if let Some(released) = self.released.take() {
                        released.await;
                    }
                    self.fail_waiters(SessionError::Closed);
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("session manager stopped");
    }

    fn configure(&mut self, options: Options) {
        info!("configure {:?}", options);
        self.advance();
        self.release();
        self.options = options;

        if self.options.target().is_empty() {
            self.fail_waiters(SessionError::NotConfigured);
            self.settle_stale();
            return;
        }
        // Callers waiting on the superseded resolution wait on the new one.
        let waiters = self.waiters.take().unwrap_or_default();
        self.resolve();
        if let Some(pending) = self.waiters.as_mut() {
            pending.extend(waiters);
        }
    }

    fn request(&mut self, reply: Reply) {
        if let Some(bean) = &self.bean {
            let _ = reply.send(Ok(bean.clone()));
            return;
        }
        if self.options.target().is_empty() {
            let _ = reply.send(Err(SessionError::NotConfigured));
            return;
        }
        if self.waiters.is_none() {
            self.resolve();
        }
        if let Some(pending) = self.waiters.as_mut() {
            pending.push(reply);
        }
    }

    fn resolve(&mut self) {
        self.waiters = Some(Vec::new());

        let epoch = self.epoch;
        let radio = self.radio.clone();
        let target = self.options.target();
        let timeout = self.options.discovery_timeout();
        let commands = self.commands.clone();
        // BlueZ shares one connection per address, so a released device must
        // be gone before the same address is connected again.
        let released = self.released.clone();

        self.resolution = Some(tokio::spawn(async move {
            if let Some(released) = released {
                released.await;
            }
            let lost = {
                let commands = commands.clone();
                move || {
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::Lost { epoch });
                    }
                }
            };
            let result = establish(radio, &target, timeout, lost).await;
            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(Command::Resolved { epoch, result });
                }
                None => {
                    if let Ok(bean) = result {
                        let _ = bean.disconnect().await;
                    }
                }
            }
        }));
    }

    fn resolved(&mut self, epoch: u64, result: Result<Bean, SessionError>) {
        if epoch != self.epoch {
            debug!("discarding resolution from epoch {} (now {})", epoch, self.epoch);
            if let Ok(bean) = result {
                self.discard(bean);
            }
            return;
        }

        self.resolution = None;
        let waiters = self.waiters.take().unwrap_or_default();
        match &result {
            Ok(bean) => {
                info!("{}: connected and set up", bean.id());
                self.bean = Some(bean.clone());
                self.armed = telemetry::arm(bean, &self.options, &self.events);
                if self.options.blink_on_connect {
                    self.armed.push(blink(bean.clone()));
                }
            }
            Err(e) => {
                error!("resolution failed: {}", e);
                let _ = self.events.send(Event::Error(e.to_string()));
            }
        }
        self.settle_stale();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn lost(&mut self, epoch: u64) {
        if epoch != self.epoch || self.bean.is_none() {
            return;
        }
        warn!("device lost, disarming telemetry");
        self.advance();
        self.armed.clear();
        self.bean = None;
    }

    fn advance(&mut self) {
        self.epoch += 1;
        if let Some(resolution) = self.resolution.take() {
            resolution.abort();
        }
    }

    fn release(&mut self) {
        self.armed.clear();
        if let Some(bean) = self.bean.take() {
            self.disconnect(bean);
        }
    }

    /// Drop a handle from a superseded resolution without tearing down a
    /// connection the live or the in-flight handle may be using.
    fn discard(&mut self, bean: Bean) {
        if self.shares_connection(&bean) {
            debug!("{}: stale handle shares the live connection", bean.id());
        } else if self.resolution.is_some() {
            self.stale.push(bean);
        } else {
            self.disconnect(bean);
        }
    }

    fn settle_stale(&mut self) {
        for bean in std::mem::take(&mut self.stale) {
            self.discard(bean);
        }
    }

    fn shares_connection(&self, bean: &Bean) -> bool {
        self.bean.as_ref().is_some_and(|live| live.id() == bean.id())
    }

    // Disconnects run one after another; the next resolution waits for them.
    fn disconnect(&mut self, bean: Bean) {
        let previous = self.released.take();
        let released = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            if let Err(e) = bean.disconnect().await {
                debug!("{}: disconnect failed: {}", bean.id(), e);
            }
        }
        .boxed()
        .shared();
        tokio::spawn(released.clone());
        self.released = Some(released);
    }

    fn fail_waiters(&mut self, error: SessionError) {
        for waiter in self.waiters.take().unwrap_or_default() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

fn blink(bean: Bean) -> Armed {
    Armed::spawn("blink", async move {
        if let Err(e) = bean.set_color(Rgb::parse("deepskyblue")).await {
            debug!("blink failed: {}", e);
            return;
        }
        tokio::time::sleep(BLINK).await;
        if let Err(e) = bean.set_color(Rgb::BLACK).await {
            debug!("blink failed: {}", e);
        }
    })
}

/// Discover, connect and negotiate.
async fn establish<F>(
    radio: Arc<dyn Radio>,
    target: &Target,
    timeout: Duration,
    on_lost: F,
) -> Result<Bean, SessionError>
where
    F: FnOnce() + Send + 'static,
{
    info!("discovering {}", target);
    let advertisements = radio
        .scan()
        .await
        .map_err(|e| SessionError::ScanFailure(e.to_string()))?;
    let advertisement = transport::discover(advertisements, target, timeout).await?;
    info!("discovered {}", advertisement);

    let link = radio
        .connect(&advertisement)
        .await
        .map_err(|e| SessionError::ConnectionFailure(e.to_string()))?;

    let negotiated = match link.negotiate().await {
        Ok(()) => Bean::attach(link.clone(), on_lost).await,
        Err(e) => Err(e),
    };
    match negotiated {
        Ok(bean) => Ok(bean),
        Err(e) => {
            if let Err(err) = link.disconnect().await {
                debug!("{}: disconnect failed: {}", link.id(), err);
            }
            Err(SessionError::NegotiationFailure(e.to_string()))
        }
    }
}
