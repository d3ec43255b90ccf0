//! Map session lifecycle.
//!
//! A session request waits out a short debounce delay, passes the quota gate,
//! then initializes the surface and waits for it to report loaded. A session
//! that does not load in time is torn down and the dashboard falls back to a
//! manual reconfiguration prompt. Every marker and line is released before a
//! session is destroyed, and a previous session is always destroyed before a
//! new one starts.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::quota::{Clock, QuotaGovernor, QuotaStore, SystemClock};
use crate::reconcile::{ConnectionLayers, MarkerReconciler};
use crate::surface::{EventHandler, ListenerId, MapEventKind, MapSurface, SessionId, SessionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Quiet period that coalesces repeated init requests
    pub init_delay: Duration,
    pub load_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_millis(300),
            load_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    LoadTimeout,
    InitFailed(String),
    SessionLost,
    QuotaStore(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Waiting out the debounce delay
    Pending { since: Instant },
    Loading { session: SessionId, started: Instant },
    Ready { session: SessionId },
    /// Needs manual reconfiguration; `force_reinit` retries
    Degraded(DegradedReason),
    /// Monthly quota exhausted
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started(SessionId),
    Ready(SessionId),
    QuotaWarning { remaining: u32 },
    QuotaExceeded { count: u32 },
    /// This process already spent its session
    AlreadyInitialized,
    Degraded(DegradedReason),
}

pub struct MapSession<Q: QuotaStore, C: Clock = SystemClock> {
    governor: QuotaGovernor<Q, C>,
    markers: MarkerReconciler,
    connections: ConnectionLayers,
    options: SessionOptions,
    timings: SessionTimings,
    phase: SessionPhase,
    session: Option<SessionId>,
    listeners: Vec<ListenerId>,
}

impl<Q: QuotaStore, C: Clock> MapSession<Q, C> {
    pub fn new(
        governor: QuotaGovernor<Q, C>,
        markers: MarkerReconciler,
        options: SessionOptions,
        timings: SessionTimings,
    ) -> Self {
        Self {
            governor,
            markers,
            connections: ConnectionLayers::new(),
            options,
            timings,
            phase: SessionPhase::Idle,
            session: None,
            listeners: Vec::new(),
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.phase, SessionPhase::Ready { .. })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    pub fn governor(&self) -> &QuotaGovernor<Q, C> {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut QuotaGovernor<Q, C> {
        &mut self.governor
    }

    pub fn markers(&self) -> &MarkerReconciler {
        &self.markers
    }

    /// Marker and connection layers of the live session
    pub fn layers_mut(&mut self) -> (&mut MarkerReconciler, &mut ConnectionLayers) {
        (&mut self.markers, &mut self.connections)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Ask for a session. Repeated requests inside the delay restart it; a
    /// request while a session is loading or live is ignored.
    pub fn request_init(&mut self, now: Instant) {
        match self.phase {
            SessionPhase::Loading { .. } | SessionPhase::Ready { .. } => {
                debug!("session already active, ignoring init request");
            }
            _ => self.phase = SessionPhase::Pending { since: now },
        }
    }

    /// Register a surface listener that lives as long as the current session
    pub fn listen<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        kind: MapEventKind,
        handler: EventHandler,
    ) -> ListenerId {
        let id = surface.on(kind, handler);
        self.listeners.push(id);
        id
    }

    /// Advance timers and surface state
    pub fn tick<S: MapSurface + ?Sized>(&mut self, surface: &mut S, now: Instant) -> Vec<SessionEvent> {
        match self.phase.clone() {
            SessionPhase::Pending { since } if now.duration_since(since) >= self.timings.init_delay => {
                self.attempt(surface, now)
            }
            SessionPhase::Loading { session, started } => {
                if surface.is_loaded() {
                    info!(?session, "map session loaded");
                    self.phase = SessionPhase::Ready { session };
                    vec![SessionEvent::Ready(session)]
                } else if now.duration_since(started) >= self.timings.load_timeout {
                    warn!(
                        ?session,
                        timeout_ms = self.timings.load_timeout.as_millis() as u64,
                        "map session did not load in time"
                    );
                    self.degrade(surface, DegradedReason::LoadTimeout)
                } else {
                    Vec::new()
                }
            }
            SessionPhase::Ready { session } if !surface.is_alive() => {
                warn!(?session, "map session lost");
                self.degrade(surface, DegradedReason::SessionLost)
            }
            _ => Vec::new(),
        }
    }

    fn attempt<S: MapSurface + ?Sized>(&mut self, surface: &mut S, now: Instant) -> Vec<SessionEvent> {
        match self.try_attempt(surface, now) {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "quota store failure, map session not started");
                self.phase = SessionPhase::Degraded(DegradedReason::QuotaStore(e.to_string()));
                vec![SessionEvent::Degraded(DegradedReason::QuotaStore(e.to_string()))]
            }
        }
    }

    fn try_attempt<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        now: Instant,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        if self.governor.session_initialized()? {
            info!("map session already initialized in this process");
            self.phase = SessionPhase::Idle;
            return Ok(vec![SessionEvent::AlreadyInitialized]);
        }
        if !self.governor.should_permit_init()? {
            let count = self.governor.get_count()?;
            warn!(count, ceiling = self.governor.limits().ceiling, "map load quota exceeded");
            self.phase = SessionPhase::Blocked;
            return Ok(vec![SessionEvent::QuotaExceeded { count }]);
        }

        self.teardown(surface);

        let mut events = Vec::new();
        let count = self.governor.increment()?;
        if self.governor.should_warn()? {
            let remaining = self.governor.limits().ceiling.saturating_sub(count);
            warn!(count, remaining, "approaching monthly map load ceiling");
            events.push(SessionEvent::QuotaWarning { remaining });
        }

        match surface.init(&self.options) {
            Ok(session) => {
                info!(?session, count, "map session started");
                self.session = Some(session);
                self.phase = SessionPhase::Loading { session, started: now };
                events.push(SessionEvent::Started(session));
                // a surface may finish loading synchronously
                events.extend(self.tick(surface, now));
            }
            Err(e) => {
                error!(error = %e, "map session failed to start");
                self.governor.reset_session_flag()?;
                let reason = DegradedReason::InitFailed(e.to_string());
                self.phase = SessionPhase::Degraded(reason.clone());
                events.push(SessionEvent::Degraded(reason));
            }
        }
        Ok(events)
    }

    fn degrade<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        reason: DegradedReason,
    ) -> Vec<SessionEvent> {
        self.teardown(surface);
        if let Err(e) = self.governor.reset_session_flag() {
            error!(error = %e, "failed to clear map session flag");
        }
        self.phase = SessionPhase::Degraded(reason.clone());
        vec![SessionEvent::Degraded(reason)]
    }

    /// Release markers, lines and listeners, then destroy the session
    pub fn teardown<S: MapSurface + ?Sized>(&mut self, surface: &mut S) {
        self.markers.clear_all(surface);
        self.connections.clear(surface);
        for id in self.listeners.drain(..) {
            surface.off(id);
        }
        if let Some(session) = self.session.take() {
            surface.destroy(session);
            info!(?session, "map session destroyed");
        }
        if !matches!(self.phase, SessionPhase::Blocked | SessionPhase::Degraded(_)) {
            self.phase = SessionPhase::Idle;
        }
    }

    /// Tear down, clear the in-process session flag and request a fresh session
    pub fn force_reinit<S: MapSurface + ?Sized>(&mut self, surface: &mut S, now: Instant) -> Result<(), StoreError> {
        self.teardown(surface);
        self.governor.reset_session_flag()?;
        self.phase = SessionPhase::Idle;
        self.request_init(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetCategory, AssetPoint};
    use crate::quota::{InMemoryQuotaStore, ManualClock, QuotaLimits, Scope};
    use crate::reconcile::RenderSpec;
    use crate::surface::RecordingSurface;
    use crate::geo::GeoPoint;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    type TestSession = MapSession<InMemoryQuotaStore, ManualClock>;

    fn options() -> SessionOptions {
        SessionOptions {
            style: "test".into(),
            center: GeoPoint::new(-122.4194, 37.7749),
            zoom: 12.0,
            max_bounds: None,
        }
    }

    fn session_with(store: InMemoryQuotaStore) -> TestSession {
        let clock = ManualClock::new(2026, 10);
        let governor = QuotaGovernor::with_clock(store, clock, QuotaLimits::default());
        MapSession::new(governor, MarkerReconciler::default(), options(), SessionTimings::default())
    }

    fn session() -> TestSession {
        session_with(InMemoryQuotaStore::new())
    }

    fn assets() -> Vec<AssetPoint> {
        (0..4)
            .map(|i| AssetPoint {
                id: format!("a{i}"),
                asset_type: AssetCategory::Pole,
                latitude: 37.7 + i as f64 * 0.01,
                longitude: -122.4,
                install_year: 2000,
                risk_score: Some(0.4),
                grid_capacity: None,
                parent_asset_id: None,
                metadata: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_debounce_coalesces_requests() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();

        s.request_init(t0);
        s.request_init(t0 + Duration::from_millis(200));
        assert!(s.tick(&mut surface, t0 + Duration::from_millis(400)).is_empty());

        let events = s.tick(&mut surface, t0 + Duration::from_millis(500));
        assert!(matches!(events[0], SessionEvent::Started(_)));
        assert!(matches!(events[1], SessionEvent::Ready(_)));
        assert_eq!(surface.sessions_started, 1);
        assert_eq!(s.governor_mut().get_count().unwrap(), 1);
        assert!(s.is_ready());
    }

    #[test]
    fn test_second_request_in_process_does_not_init() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();
        s.request_init(t0);
        s.tick(&mut surface, t0 + Duration::from_secs(1));

        s.teardown(&mut surface);
        s.request_init(t0 + Duration::from_secs(2));
        let events = s.tick(&mut surface, t0 + Duration::from_secs(3));
        assert_eq!(events, vec![SessionEvent::AlreadyInitialized]);
        assert_eq!(surface.sessions_started, 1);
    }

    #[test]
    fn test_quota_exceeded_blocks() {
        let mut store = InMemoryQuotaStore::new();
        store.set(Scope::Persistent, "map_loads_month", "2026-10").unwrap();
        store.set(Scope::Persistent, "map_loads_count", "50000").unwrap();
        let mut s = session_with(store);
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();

        s.request_init(t0);
        let events = s.tick(&mut surface, t0 + Duration::from_secs(1));
        assert_eq!(events, vec![SessionEvent::QuotaExceeded { count: 50_000 }]);
        assert_eq!(s.phase(), &SessionPhase::Blocked);
        assert_eq!(surface.sessions_started, 0);
    }

    #[test]
    fn test_warning_emitted_near_ceiling() {
        let mut store = InMemoryQuotaStore::new();
        store.set(Scope::Persistent, "map_loads_month", "2026-10").unwrap();
        store.set(Scope::Persistent, "map_loads_count", "49500").unwrap();
        let mut s = session_with(store);
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();

        s.request_init(t0);
        let events = s.tick(&mut surface, t0 + Duration::from_secs(1));
        assert!(events.contains(&SessionEvent::QuotaWarning { remaining: 499 }));
    }

    #[test]
    fn test_load_timeout_degrades_and_clears_flag() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        surface.loads_on_init = false;
        let t0 = Instant::now();

        s.request_init(t0);
        s.tick(&mut surface, t0 + Duration::from_millis(300));
        assert!(matches!(s.phase(), SessionPhase::Loading { .. }));
        assert!(s.tick(&mut surface, t0 + Duration::from_secs(4)).is_empty());

        let events = s.tick(&mut surface, t0 + Duration::from_millis(5_300));
        assert_eq!(events, vec![SessionEvent::Degraded(DegradedReason::LoadTimeout)]);
        assert_eq!(surface.sessions_destroyed, 1);
        assert!(!surface.is_alive());
        assert!(!s.governor().session_initialized().unwrap());
    }

    #[test]
    fn test_force_reinit_releases_markers_first() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();
        s.request_init(t0);
        s.tick(&mut surface, t0 + Duration::from_secs(1));

        let (markers, _) = s.layers_mut();
        markers.reconcile(&mut surface, &assets(), &RenderSpec::default());
        assert_eq!(surface.live_markers(), 4);
        let removed_before = surface.removed;

        s.force_reinit(&mut surface, t0 + Duration::from_secs(2)).unwrap();
        // markers went through remove_marker, not through session destruction
        assert_eq!(surface.removed, removed_before + 4);
        assert_eq!(s.markers().live_count(), 0);
        assert_eq!(surface.sessions_destroyed, 1);

        let events = s.tick(&mut surface, t0 + Duration::from_secs(3));
        assert!(matches!(events[0], SessionEvent::Started(_)));
        assert_eq!(surface.sessions_started, 2);
        assert_eq!(s.governor_mut().get_count().unwrap(), 2);
    }

    #[test]
    fn test_listeners_removed_on_teardown() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();
        s.request_init(t0);
        s.tick(&mut surface, t0 + Duration::from_secs(1));

        s.listen(&mut surface, MapEventKind::ZoomEnd, Box::new(|_| {}));
        assert_eq!(surface.listener_count(), 1);
        s.teardown(&mut surface);
        assert_eq!(surface.listener_count(), 0);
        assert_eq!(s.phase(), &SessionPhase::Idle);
    }

    #[test]
    fn test_lost_session_degrades() {
        let mut s = session();
        let mut surface = RecordingSurface::new();
        let t0 = Instant::now();
        s.request_init(t0);
        s.tick(&mut surface, t0 + Duration::from_secs(1));

        surface.kill();
        let events = s.tick(&mut surface, t0 + Duration::from_secs(2));
        assert_eq!(events, vec![SessionEvent::Degraded(DegradedReason::SessionLost)]);
    }
}
