//! The lifecycle loop of one stream.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::announcement::run_announcement;
use super::encoder::EncoderSupervisor;
use super::mailbox::Delivery;
use super::poller::{PollOutcome, Poller};
use super::state::{FailureClass, StreamShared, StreamState};
use super::{StreamContext, StreamSettings};
use crate::client::{
    BroadcastId, Challenge, LiveSession, PasswordLogin, RecapRequest, ServiceError, ServiceResult,
};
use crate::error::{Error, Result};
use crate::records::FinalAudienceRecord;

/// An open remote broadcast. Valid only for one live cycle.
#[derive(Debug, Clone)]
struct BroadcastHandle {
    id: BroadcastId,
    ingest_url: String,
    started_at: Instant,
}

/// What to do once the broadcast has been ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterPosting {
    /// Normal end of cycle.
    Ready,
    /// The cycle failed; cool down first.
    Backoff,
    /// The stream is being stopped.
    Exit,
}

enum Step {
    Ready { cooldown: bool },
    LoggingIn,
    LoginError,
    ChallengeRequired {
        api_path: String,
        challenge: Box<dyn Challenge>,
    },
    ChallengeError,
    CreatingBroadcast(Arc<dyn LiveSession>),
    CreateBroadcastError(Arc<dyn LiveSession>),
    Streaming(Arc<dyn LiveSession>, BroadcastHandle),
    Posting {
        session: Arc<dyn LiveSession>,
        broadcast: BroadcastHandle,
        then: AfterPosting,
    },
    Exit,
}

impl Step {
    fn state(&self) -> StreamState {
        match self {
            Step::Ready { .. } | Step::Exit => StreamState::Ready,
            Step::LoggingIn => StreamState::LoggingIn,
            Step::LoginError => StreamState::LoginError,
            Step::ChallengeRequired { .. } => StreamState::ChallengeRequired,
            Step::ChallengeError => StreamState::ChallengeError,
            Step::CreatingBroadcast(_) => StreamState::CreatingBroadcast,
            Step::CreateBroadcastError(_) => StreamState::CreateBroadcastError,
            Step::Streaming(..) => StreamState::Streaming,
            Step::Posting { .. } => StreamState::Posting,
        }
    }
}

pub(super) struct StreamRunner {
    shared: Arc<StreamShared>,
    settings: Arc<StreamSettings>,
    context: StreamContext,
    cancel: CancellationToken,
}

impl StreamRunner {
    pub(super) fn new(
        shared: Arc<StreamShared>,
        settings: Arc<StreamSettings>,
        context: StreamContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            settings,
            context,
            cancel,
        }
    }

    fn account(&self) -> &str {
        &self.shared.name
    }

    /// Runs until the stream's token is cancelled.
    pub(super) async fn run(self) {
        let mut step = Step::Ready { cooldown: false };

        loop {
            let state = step.state();
            if self.shared.state.get() != state {
                debug!(account = %self.account(), state = %state, "State changed");
            }
            self.shared.state.set(state);

            step = match step {
                Step::Exit => break,
                Step::Ready { cooldown: true } => self.cooldown(Step::LoggingIn).await,
                Step::Ready { cooldown: false } => {
                    if self.cancel.is_cancelled() {
                        Step::Exit
                    } else {
                        Step::LoggingIn
                    }
                }
                Step::LoggingIn => self.login().await,
                Step::LoginError | Step::ChallengeError => self.cooldown(Step::LoggingIn).await,
                Step::ChallengeRequired {
                    api_path,
                    challenge,
                } => self.respond_challenge(api_path, challenge).await,
                Step::CreatingBroadcast(session) => self.create_broadcast(session).await,
                Step::CreateBroadcastError(session) => {
                    self.cooldown(Step::CreatingBroadcast(session)).await
                }
                Step::Streaming(session, broadcast) => self.stream(session, broadcast).await,
                Step::Posting {
                    session,
                    broadcast,
                    then,
                } => self.post(session, broadcast, then).await,
            };
        }

        self.shared.state.set(StreamState::Ready);
        debug!(account = %self.account(), "Lifecycle loop exited");
    }

    /// Await `fut` unless the stream is cancelled first.
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    async fn cooldown(&self, next: Step) -> Step {
        let delay = self.settings.timings.cooldown;
        debug!(account = %self.account(), ?delay, "Cooling down");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Exit,
            _ = tokio::time::sleep(delay) => next,
        }
    }

    fn fail(&self, class: FailureClass, message: impl Into<String>) {
        self.shared.record_error(class, message);
    }

    async fn login(&self) -> Step {
        let account = self.account();
        let Some(credentials) = self.context.credentials.credentials(account) else {
            error!(account = %account, "Account is not configured");
            self.fail(FailureClass::Backoff, "account is not configured");
            return Step::LoginError;
        };

        if let Some(token) = credentials.token.as_deref() {
            debug!(account = %account, "Logging in by token");
            match self
                .cancellable(self.context.connector.login_with_token(account, token))
                .await
            {
                None => return Step::Exit,
                Some(Ok(session)) => {
                    info!(account = %account, "Logged in by token");
                    return Step::CreatingBroadcast(session);
                }
                Some(Err(e)) => {
                    warn!(account = %account, error = %e, "Token login failed, retrying with password");
                }
            }
        }

        let Some(password) = credentials.password.as_deref() else {
            error!(account = %account, "No usable credentials");
            self.fail(FailureClass::Backoff, "token rejected and no password configured");
            return Step::LoginError;
        };

        debug!(account = %account, "Logging in by password");
        match self
            .cancellable(self.context.connector.login_with_password(account, password))
            .await
        {
            None => Step::Exit,
            Some(Ok(PasswordLogin::Authenticated(session))) => {
                info!(account = %account, "Logged in by password");
                self.persist_token(session.as_ref()).await;
                Step::CreatingBroadcast(session)
            }
            Some(Ok(PasswordLogin::ChallengeRequired {
                api_path,
                challenge,
            })) => {
                warn!(account = %account, "Challenge code is required");
                Step::ChallengeRequired {
                    api_path,
                    challenge,
                }
            }
            Some(Err(e)) => {
                error!(account = %account, error = %e, "Login failed");
                self.fail(FailureClass::Backoff, format!("login failed: {e}"));
                Step::LoginError
            }
        }
    }

    async fn respond_challenge(&self, api_path: String, mut challenge: Box<dyn Challenge>) -> Step {
        let account = self.account();

        match self.cancellable(challenge.begin(&api_path)).await {
            None => return Step::Exit,
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(account = %account, error = %e, "Unable to begin challenge");
                self.fail(FailureClass::Backoff, format!("challenge failed: {e}"));
                return Step::ChallengeError;
            }
        }

        let deadline = Instant::now() + self.settings.timings.challenge_timeout;
        info!(account = %account, "Waiting for security code");

        loop {
            let code = match self.shared.mailbox.recv(deadline, &self.cancel).await {
                Delivery::Code(code) => code,
                Delivery::Cancelled => return Step::Exit,
                Delivery::TimedOut => {
                    error!(account = %account, "Timed out waiting for security code");
                    self.fail(FailureClass::Backoff, "timed out waiting for security code");
                    return Step::ChallengeError;
                }
            };

            debug!(account = %account, "Submitting security code");
            match self.cancellable(challenge.submit(&code)).await {
                None => return Step::Exit,
                Some(Ok(session)) => {
                    info!(account = %account, "Challenge completed");
                    self.persist_token(session.as_ref()).await;
                    return Step::CreatingBroadcast(session);
                }
                Some(Err(ServiceError::InvalidSecurityCode(reason))) => {
                    warn!(account = %account, %reason, "Security code rejected, waiting for another");
                }
                Some(Err(e)) => {
                    error!(account = %account, error = %e, "Unable to submit security code");
                    self.fail(FailureClass::Backoff, format!("challenge failed: {e}"));
                    return Step::ChallengeError;
                }
            }
        }
    }

    /// Write the refreshed session token back. Failure is logged; the
    /// session itself stays usable.
    async fn persist_token(&self, session: &dyn LiveSession) {
        let account = self.account();
        let persisted = match session.export_token() {
            Ok(token) => match self.context.credentials.set_token(account, token) {
                Ok(()) => self.context.credentials.save().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(Error::Service(e)),
        };

        match persisted {
            Ok(()) => debug!(account = %account, "Session token persisted"),
            Err(e) => {
                warn!(account = %account, error = %e, "Failed to persist session token");
                self.fail(FailureClass::BestEffort, format!("token not persisted: {e}"));
            }
        }
    }

    /// Not cancellable: once the remote broadcast exists it has to be ended,
    /// so a stop arriving meanwhile goes through posting.
    async fn create_broadcast(&self, session: Arc<dyn LiveSession>) -> Step {
        let account = self.account();
        if self.cancel.is_cancelled() {
            return Step::Exit;
        }

        match self.open_broadcast(session.as_ref()).await {
            Ok(broadcast) if self.cancel.is_cancelled() => {
                info!(account = %account, broadcast_id = broadcast.id, "Stopped while starting, ending broadcast");
                Step::Posting {
                    session,
                    broadcast,
                    then: AfterPosting::Exit,
                }
            }
            Ok(broadcast) => {
                info!(account = %account, broadcast_id = broadcast.id, "Broadcast started");
                self.shared.clear_error();
                Step::Streaming(session, broadcast)
            }
            Err(e) if e.requires_login() => {
                warn!(account = %account, "Session expired while creating broadcast");
                self.fail(FailureClass::Reauthenticate, e.to_string());
                Step::LoggingIn
            }
            Err(e) => {
                error!(account = %account, error = %e, "Unable to create broadcast");
                self.fail(FailureClass::Backoff, format!("create broadcast failed: {e}"));
                Step::CreateBroadcastError(session)
            }
        }
    }

    async fn open_broadcast(&self, session: &dyn LiveSession) -> ServiceResult<BroadcastHandle> {
        let settings = &self.settings;
        let created = session
            .create_broadcast(settings.width, settings.height, &settings.title)
            .await?;

        debug!(account = %self.account(), broadcast_id = created.id, "Starting broadcast");
        session.start_broadcast(created.id, settings.notify).await?;
        session.unmute_comments(created.id).await?;
        session.disable_join_requests(created.id).await?;

        Ok(BroadcastHandle {
            id: created.id,
            ingest_url: created.ingest_url,
            started_at: Instant::now(),
        })
    }

    /// Run the encoder, the poller and the announcement until one of them
    /// ends the cycle or the stream is cancelled.
    async fn stream(&self, session: Arc<dyn LiveSession>, broadcast: BroadcastHandle) -> Step {
        let account = self.account().to_string();
        let timings = &self.settings.timings;
        let scope = self.cancel.child_token();

        let encoder = EncoderSupervisor::new(
            self.shared.clone(),
            self.settings.encoder.clone(),
            self.settings.input_url.clone(),
            broadcast.ingest_url.clone(),
            timings.encoder_restart,
            timings.grace_period,
        );
        let poller = Poller {
            account: account.clone(),
            session: session.clone(),
            broadcast_id: broadcast.id,
            forwarder: self.context.forwarder.clone(),
            records: self.context.records.clone(),
            interval: timings.poll_interval,
            comments_per_fetch: timings.comments_per_fetch,
            max_failures: timings.max_poll_failures,
        };

        let encoder_task = {
            let scope = scope.clone();
            tokio::spawn(async move {
                let result = encoder.run(&scope).await;
                scope.cancel();
                result
            })
        };
        let poller_task = {
            let scope = scope.clone();
            tokio::spawn(async move {
                let result = poller.run(&scope).await;
                scope.cancel();
                result
            })
        };
        let announcement_task = tokio::spawn(run_announcement(
            account.clone(),
            session.clone(),
            broadcast.id,
            self.settings.announcement.clone(),
            scope.clone(),
        ));

        let (encoder_result, poller_result, announcement_result) =
            tokio::join!(encoder_task, poller_task, announcement_task);

        if let Err(e) = announcement_result {
            warn!(account = %account, error = %e, "Announcement task failed");
        }
        let encoder_result = encoder_result.map_err(Error::from).and_then(|r| r);
        let poller_result = poller_result.map_err(Error::from).and_then(|r| r);

        let then = match classify_cycle(&encoder_result, &poller_result, self.cancel.is_cancelled()) {
            CycleEnd::Reauthenticate => {
                warn!(account = %account, broadcast_id = broadcast.id, "Session expired while streaming");
                self.fail(FailureClass::Reauthenticate, "session expired while streaming");
                return Step::LoggingIn;
            }
            CycleEnd::Cancelled => AfterPosting::Exit,
            CycleEnd::Stopped => {
                self.fail(FailureClass::EndOfCycle, "broadcast stopped remotely");
                AfterPosting::Ready
            }
            CycleEnd::Failed(message) => {
                error!(account = %account, broadcast_id = broadcast.id, error = %message, "Live cycle failed");
                self.fail(FailureClass::Backoff, message);
                AfterPosting::Backoff
            }
        };

        Step::Posting {
            session,
            broadcast,
            then,
        }
    }

    /// End the broadcast and publish it. Runs to completion even while the
    /// stream is being stopped.
    async fn post(
        &self,
        session: Arc<dyn LiveSession>,
        broadcast: BroadcastHandle,
        then: AfterPosting,
    ) -> Step {
        let account = self.account();

        match session.end_broadcast(broadcast.id).await {
            Ok(()) => {
                info!(account = %account, broadcast_id = broadcast.id, "Broadcast ended");
                self.publish(session.as_ref(), &broadcast).await;
                self.save_final_audience(session.as_ref(), &broadcast).await;
            }
            Err(e) if e.requires_login() => {
                warn!(account = %account, broadcast_id = broadcast.id, "Session expired while ending broadcast");
                self.fail(FailureClass::Reauthenticate, e.to_string());
                if then != AfterPosting::Exit {
                    return Step::LoggingIn;
                }
            }
            Err(e) => {
                error!(account = %account, broadcast_id = broadcast.id, error = %e, "Unable to end broadcast");
                self.fail(FailureClass::BestEffort, format!("end broadcast failed: {e}"));
            }
        }

        match then {
            AfterPosting::Ready => Step::Ready { cooldown: false },
            AfterPosting::Backoff => Step::Ready { cooldown: true },
            AfterPosting::Exit => Step::Exit,
        }
    }

    /// Recap when enabled and long enough, story otherwise. Never both.
    async fn publish(&self, session: &dyn LiveSession, broadcast: &BroadcastHandle) {
        let account = self.account();
        let recap = &self.settings.recap;
        let elapsed = broadcast.started_at.elapsed();

        if recap.enabled && elapsed >= recap.min_duration() {
            match self.publish_recap(session, broadcast.id).await {
                Ok(()) => info!(account = %account, broadcast_id = broadcast.id, "Recap published"),
                Err(e) => {
                    error!(account = %account, broadcast_id = broadcast.id, error = %e, "Unable to publish recap");
                    self.fail(FailureClass::BestEffort, format!("recap failed: {e}"));
                }
            }
            return;
        }

        if recap.enabled {
            debug!(account = %account, ?elapsed, "Broadcast too short for a recap");
        }

        match session.publish_story(broadcast.id).await {
            Ok(()) => info!(account = %account, broadcast_id = broadcast.id, "Posted to story"),
            Err(e) => {
                error!(account = %account, broadcast_id = broadcast.id, error = %e, "Unable to post to story");
                self.fail(FailureClass::BestEffort, format!("story failed: {e}"));
            }
        }
    }

    async fn publish_recap(&self, session: &dyn LiveSession, id: BroadcastId) -> ServiceResult<()> {
        let thumbnails = session.fetch_thumbnails(id).await?;
        let Some(cover_url) = middle(&thumbnails) else {
            return Err(ServiceError::status("no thumbnails available"));
        };

        let image = session.fetch_image(cover_url).await?;
        let cover_asset_id = session.upload_image(image).await?;

        let recap = &self.settings.recap;
        session
            .publish_recap(&RecapRequest {
                broadcast_id: id,
                cover_asset_id,
                title: self.settings.title.clone(),
                description: recap.description.clone(),
                share_to_feed: recap.share_to_feed,
            })
            .await
    }

    async fn save_final_audience(&self, session: &dyn LiveSession, broadcast: &BroadcastHandle) {
        let Some(records) = &self.context.records else {
            return;
        };
        let account = self.account();

        let audience = match session.fetch_final_audience(broadcast.id).await {
            Ok(audience) => audience,
            Err(e) => {
                warn!(account = %account, broadcast_id = broadcast.id, error = %e, "Unable to fetch final audience");
                return;
            }
        };

        let record = FinalAudienceRecord {
            recorded_at: Utc::now(),
            broadcast_id: broadcast.id,
            account: account.to_string(),
            audience,
        };
        if let Err(e) = records.final_audience(&record).await {
            warn!(account = %account, broadcast_id = broadcast.id, error = %e, "Unable to save final audience");
        }
    }
}

/// Thumbnail near the middle of the broadcast.
fn middle(items: &[String]) -> Option<&str> {
    items.get(items.len() / 2).map(String::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CycleEnd {
    Reauthenticate,
    Cancelled,
    Stopped,
    Failed(String),
}

fn classify_cycle(
    encoder: &Result<()>,
    poller: &Result<PollOutcome>,
    stream_cancelled: bool,
) -> CycleEnd {
    if matches!(poller, Err(e) if e.requires_login()) {
        return CycleEnd::Reauthenticate;
    }
    if stream_cancelled {
        return CycleEnd::Cancelled;
    }
    if let Ok(PollOutcome::Stopped) = poller {
        return CycleEnd::Stopped;
    }
    match (encoder, poller) {
        (Err(e), _) | (_, Err(e)) => CycleEnd::Failed(e.to_string()),
        // Scope ended without a reason of its own; treat like a remote stop.
        _ => CycleEnd::Stopped,
    }
}
