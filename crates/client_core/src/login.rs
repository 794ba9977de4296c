use std::collections::{BTreeMap, BTreeSet};

use shared::{
    domain::{Handle, LoginState, Uri},
    error::{status, ClientError},
    protocol::RequestBody,
};
use tracing::{info, warn};

use crate::{
    events::{ClientEvent, EventSink},
    session_group::SessionGroup,
    ReconcileCtx,
};

#[derive(Debug, Clone, Copy, Default)]
struct BlockRule {
    desired: bool,
    current: bool,
}

/// One account's login lifecycle, its session group, and the per-user block
/// policy. Logging in and out only flip desired state here; the actual
/// requests go out on the next reconciliation pass.
#[derive(Debug, Clone)]
pub struct LoginManager {
    account_name: String,
    handle: Handle,
    credentials: String,
    desired: LoginState,
    current: LoginState,
    session_group: SessionGroup,
    block_rules: BTreeMap<Uri, BlockRule>,
    block_in_flight: bool,
    unblock_in_flight: bool,
    actual_blocked: BTreeSet<Uri>,
    relogin_attempted: bool,
}

impl LoginManager {
    pub fn new(account_name: String, handle: Handle, session_group_handle: Handle) -> Self {
        Self {
            account_name,
            handle,
            credentials: String::new(),
            desired: LoginState::LoggedOut,
            current: LoginState::LoggedOut,
            session_group: SessionGroup::new(session_group_handle),
            block_rules: BTreeMap::new(),
            block_in_flight: false,
            unblock_in_flight: false,
            actual_blocked: BTreeSet::new(),
            relogin_attempted: false,
        }
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn desired(&self) -> LoginState {
        self.desired
    }

    pub fn current(&self) -> LoginState {
        self.current
    }

    pub fn session_group(&self) -> &SessionGroup {
        &self.session_group
    }

    pub fn session_group_mut(&mut self) -> &mut SessionGroup {
        &mut self.session_group
    }

    pub fn set_desired_logged_in(&mut self, credentials: String) {
        self.desired = LoginState::LoggedIn;
        self.credentials = credentials;
    }

    pub fn set_desired_logged_out(&mut self) {
        self.desired = LoginState::LoggedOut;
    }

    pub fn block_users(&mut self, uris: &[Uri]) {
        for uri in uris {
            self.block_rules.entry(uri.clone()).or_default().desired = true;
        }
    }

    pub fn unblock_users(&mut self, uris: &[Uri]) {
        for uri in uris {
            self.block_rules.entry(uri.clone()).or_default().desired = false;
        }
    }

    pub fn check_blocked_user(&self, uri: &Uri) -> bool {
        self.actual_blocked.contains(uri)
    }

    pub fn next_state(
        &mut self,
        ctx: &mut ReconcileCtx<'_>,
        connector_handle: &Handle,
    ) -> Result<(), ClientError> {
        match (self.desired, self.current) {
            (LoginState::LoggedIn, LoginState::LoggedOut) => {
                ctx.issue(RequestBody::Login {
                    connector_handle: connector_handle.clone(),
                    account_handle: self.handle.clone(),
                    account_name: self.account_name.clone(),
                    credentials: self.credentials.clone(),
                })?;
                self.current = LoginState::LoggingIn;
            }
            (LoginState::LoggedOut, LoginState::LoggedIn) => {
                ctx.issue(RequestBody::Logout {
                    account_handle: self.handle.clone(),
                })?;
                self.current = LoginState::LoggingOut;
            }
            (LoginState::LoggedIn, LoginState::LoggedIn) => {
                self.reconcile_block_rules(ctx)?;
                self.session_group.next_state(ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Bulk block reconciliation: at most one block request and one unblock
    /// request per pass, each carrying all newly diverged URIs joined with a
    /// line feed.
    fn reconcile_block_rules(&mut self, ctx: &mut ReconcileCtx<'_>) -> Result<(), ClientError> {
        if !self.block_in_flight {
            let to_block: Vec<&str> = self
                .block_rules
                .iter()
                .filter(|(_, rule)| rule.desired && !rule.current)
                .map(|(uri, _)| uri.as_str())
                .collect();
            if !to_block.is_empty() {
                ctx.issue(RequestBody::BlockUsers {
                    account_handle: self.handle.clone(),
                    user_uris: to_block.join("\n"),
                    block: true,
                })?;
                self.block_in_flight = true;
            }
        }
        if !self.unblock_in_flight {
            let to_unblock: Vec<&str> = self
                .block_rules
                .iter()
                .filter(|(_, rule)| !rule.desired && rule.current)
                .map(|(uri, _)| uri.as_str())
                .collect();
            if !to_unblock.is_empty() {
                ctx.issue(RequestBody::BlockUsers {
                    account_handle: self.handle.clone(),
                    user_uris: to_unblock.join("\n"),
                    block: false,
                })?;
                self.unblock_in_flight = true;
            }
        }
        Ok(())
    }

    pub fn on_login_response(&mut self, success: bool, status_code: i32, events: &EventSink) {
        if success {
            self.current = LoginState::LoggedIn;
            self.relogin_attempted = false;
            info!(account = %self.account_name, "login completed");
            events.emit(ClientEvent::LoginCompleted {
                account: self.account_name.clone(),
            });
        } else {
            self.desired = LoginState::LoggedOut;
            self.current = LoginState::LoggedOut;
            events.emit(ClientEvent::LoginFailed {
                account: self.account_name.clone(),
                status_code,
            });
        }
    }

    pub fn on_logout_response(&mut self, events: &EventSink) {
        self.desired = LoginState::LoggedOut;
        self.current = LoginState::LoggedOut;
        self.session_group.clear();
        events.emit(ClientEvent::LogoutCompleted {
            account: self.account_name.clone(),
        });
    }

    /// Confirmed block-rule changes move the actual-blocked working set that
    /// answers `check_blocked_user`. Failures leave desired state untouched
    /// so the next pass retries; there is deliberately no auto-revert here.
    pub fn on_block_response(
        &mut self,
        success: bool,
        user_uris: &str,
        block: bool,
        status_code: i32,
        events: &EventSink,
    ) {
        if block {
            self.block_in_flight = false;
        } else {
            self.unblock_in_flight = false;
        }
        let uris: Vec<Uri> = user_uris
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(Uri::new)
            .collect();
        if !success {
            warn!(account = %self.account_name, status_code, "block rule change rejected");
            events.emit(ClientEvent::BlockRuleFailed {
                account: self.account_name.clone(),
                status_code,
            });
            return;
        }
        for uri in &uris {
            if let Some(rule) = self.block_rules.get_mut(uri) {
                rule.current = block;
            }
            if block {
                self.actual_blocked.insert(uri.clone());
            } else {
                self.actual_blocked.remove(uri);
            }
        }
        self.block_rules
            .retain(|_, rule| rule.desired || rule.current);
        events.emit(ClientEvent::BlockRuleApplied {
            account: self.account_name.clone(),
            user_uris: uris,
            blocked: block,
        });
    }

    /// Unsolicited login-state change. A logged-out event with a
    /// network-class status while we still want to be logged in is treated
    /// as transient: current drops to LoggedOut and the next pass re-issues
    /// the login, at most once per login attempt.
    pub fn on_login_state_event(&mut self, state: LoginState, status_code: i32, events: &EventSink) {
        match state {
            LoginState::LoggedIn => {
                if self.current != LoginState::LoggedIn {
                    self.on_login_response(true, status_code, events);
                }
            }
            LoginState::LoggedOut => {
                self.current = LoginState::LoggedOut;
                if self.desired == LoginState::LoggedIn {
                    if status::is_network_class(status_code) && !self.relogin_attempted {
                        self.relogin_attempted = true;
                        info!(
                            account = %self.account_name,
                            status_code,
                            "transient network logout; retrying login"
                        );
                    } else {
                        self.desired = LoginState::LoggedOut;
                        events.emit(ClientEvent::LoginFailed {
                            account: self.account_name.clone(),
                            status_code,
                        });
                    }
                } else {
                    events.emit(ClientEvent::LogoutCompleted {
                        account: self.account_name.clone(),
                    });
                }
            }
            LoginState::LoggingIn | LoginState::LoggingOut => {
                self.current = state;
            }
        }
    }
}
