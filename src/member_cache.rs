//! Shared per-guild member lookup cache with in-flight request coalescing
//!
//! One [`MemberCache`] instance exists per guild and is shared by every
//! channel export running against that guild. Arbitrarily many callers may
//! resolve the same member id concurrently; the cache guarantees at most one
//! remote "get guild member" call (and, on a miss, at most one "get user"
//! call) per distinct id for its whole lifetime. Losers of the install race
//! attach to the winner's in-flight future instead of issuing their own
//! request.
//!
//! "Confirmed absent" is a first-class cached value: a user who left the
//! guild and whose account is gone resolves to `None` once and is never
//! re-fetched, which matters for channels full of historical mentions of
//! departed users.

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::types::{Member, Snowflake, User};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An in-flight member fetch that multiple callers can await.
///
/// Errors cross the share boundary as `Arc<Error>` so every waiter observes
/// the same failure; they are not cached, so a later caller may retry.
type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Option<Member>, Arc<Error>>>>;

/// Process-shared, per-guild table from member id to resolved member-or-absent
pub struct MemberCache {
    guild_id: Snowflake,
    api: Arc<dyn ApiClient>,
    cancel: CancellationToken,
    /// Completed lookups, including negative results
    resolved: Arc<Mutex<HashMap<Snowflake, Option<Member>>>>,
    /// In-flight fetches; entries are removed once the fetch completes
    pending: Mutex<HashMap<Snowflake, SharedFetch>>,
}

impl MemberCache {
    /// Create a cache for one guild
    pub fn new(api: Arc<dyn ApiClient>, guild_id: Snowflake, cancel: CancellationToken) -> Self {
        Self {
            guild_id,
            api,
            cancel,
            resolved: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a member id to its member record, or `None` if the user has
    /// no membership and no surviving account.
    ///
    /// When the caller already holds user data from a message payload it
    /// should pass it as `fallback`; a guild-left user is then synthesized
    /// locally without a redundant "get user" call.
    pub async fn resolve(
        &self,
        member_id: Snowflake,
        fallback: Option<&User>,
    ) -> Result<Option<Member>> {
        if let Some(existing) = self.resolved.lock().await.get(&member_id) {
            return Ok(existing.clone());
        }

        // Install-or-join: exactly one fetch future exists per id at a time.
        let fetch = {
            let mut pending = self.pending.lock().await;
            match pending.get(&member_id) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.spawn_fetch(member_id, fallback.cloned());
                    pending.insert(member_id, fetch.clone());
                    fetch
                }
            }
        };

        let outcome = fetch.clone().await;

        // Whichever awaiter gets here first clears the marker; ptr_eq guards
        // against evicting a newer fetch installed after an earlier failure.
        {
            let mut pending = self.pending.lock().await;
            if pending.get(&member_id).is_some_and(|f| fetch.ptr_eq(f)) {
                pending.remove(&member_id);
            }
        }

        outcome.map_err(Error::Coalesced)
    }

    /// Cache-only lookup; never triggers a fetch.
    ///
    /// Returns `None` both for confirmed-absent members and for ids that
    /// have not been resolved yet.
    pub async fn peek(&self, member_id: Snowflake) -> Option<Member> {
        self.resolved.lock().await.get(&member_id).cloned().flatten()
    }

    fn spawn_fetch(&self, member_id: Snowflake, fallback: Option<User>) -> SharedFetch {
        let api = Arc::clone(&self.api);
        let guild_id = self.guild_id;
        let cancel = self.cancel.clone();
        let resolved = Arc::clone(&self.resolved);

        async move {
            // A racing resolver may have completed between the caller's
            // fast-path check and this future starting to run.
            if let Some(existing) = resolved.lock().await.get(&member_id) {
                return Ok(existing.clone());
            }

            let member = tokio::select! {
                _ = cancel.cancelled() => return Err(Arc::new(Error::Cancelled)),
                result = api.get_guild_member(guild_id, member_id) => {
                    result.map_err(Arc::new)?
                }
            };

            let member = match member {
                Some(member) => Some(member),
                None => {
                    let user = match fallback {
                        Some(user) => Some(user),
                        None => tokio::select! {
                            _ = cancel.cancelled() => return Err(Arc::new(Error::Cancelled)),
                            result = api.get_user(member_id) => result.map_err(Arc::new)?,
                        },
                    };
                    if user.is_none() {
                        tracing::debug!(%member_id, "member and user both absent, caching negative result");
                    }
                    user.map(Member::fallback)
                }
            };

            resolved.lock().await.insert(member_id, member.clone());
            Ok(member)
        }
        .boxed()
        .shared()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::types::{Channel, Guild, Role};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Mock API that records call counts and resolves after a short delay,
    /// widening the race window for the coalescing assertions.
    struct MockApi {
        members: HashMap<Snowflake, Member>,
        users: HashMap<Snowflake, User>,
        member_calls: AtomicU32,
        user_calls: AtomicU32,
        delay: Duration,
        fail_member_lookups: bool,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                members: HashMap::new(),
                users: HashMap::new(),
                member_calls: AtomicU32::new(0),
                user_calls: AtomicU32::new(0),
                delay: Duration::from_millis(20),
                fail_member_lookups: false,
            }
        }

        fn with_member(mut self, member: Member) -> Self {
            self.members.insert(member.user.id, member);
            self
        }

        fn with_user(mut self, user: User) -> Self {
            self.users.insert(user.id, user);
            self
        }
    }

    #[async_trait]
    impl ApiClient for MockApi {
        async fn get_guild(&self, guild_id: Snowflake) -> Result<Guild> {
            Ok(Guild {
                id: guild_id,
                name: "test guild".to_string(),
                icon_url: None,
            })
        }

        async fn get_guild_member(
            &self,
            _guild_id: Snowflake,
            member_id: Snowflake,
        ) -> Result<Option<Member>> {
            self.member_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_member_lookups {
                return Err(Error::Api(ApiError::Status {
                    status: 500,
                    message: "boom".to_string(),
                }));
            }
            Ok(self.members.get(&member_id).cloned())
        }

        async fn get_user(&self, user_id: Snowflake) -> Result<Option<User>> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.users.get(&user_id).cloned())
        }

        fn get_guild_channels(&self, _guild_id: Snowflake) -> BoxStream<'_, Result<Channel>> {
            Box::pin(futures::stream::empty())
        }

        fn get_guild_roles(&self, _guild_id: Snowflake) -> BoxStream<'_, Result<Role>> {
            Box::pin(futures::stream::empty())
        }
    }

    fn user(id: u64) -> User {
        User {
            id: Snowflake::new(id),
            is_bot: false,
            discriminator: None,
            name: format!("user{id}"),
            display_name: format!("User {id}"),
            avatar_url: None,
        }
    }

    fn member(id: u64, roles: &[u64]) -> Member {
        Member {
            user: user(id),
            nick: Some(format!("nick{id}")),
            avatar_url: None,
            role_ids: roles.iter().copied().map(Snowflake::new).collect(),
        }
    }

    fn cache(api: MockApi) -> (Arc<MemberCache>, Arc<MockApi>) {
        let api = Arc::new(api);
        let cache = Arc::new(MemberCache::new(
            api.clone(),
            Snowflake::new(1),
            CancellationToken::new(),
        ));
        (cache, api)
    }

    #[tokio::test]
    async fn concurrent_resolves_trigger_a_single_remote_call() {
        let (cache, api) = cache(MockApi::new().with_member(member(100, &[10])));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(Snowflake::new(100), None).await })
            })
            .collect();

        for task in tasks {
            let resolved = task.await.unwrap().unwrap();
            assert_eq!(resolved.unwrap().nick.as_deref(), Some("nick100"));
        }

        assert_eq!(
            api.member_calls.load(Ordering::SeqCst),
            1,
            "all 16 callers must share one remote call"
        );
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn guild_left_user_is_synthesized_as_fallback_member() {
        let (cache, api) = cache(MockApi::new().with_user(user(200)));

        let resolved = cache.resolve(Snowflake::new(200), None).await.unwrap();
        let member = resolved.unwrap();
        assert!(member.role_ids.is_empty());
        assert!(member.nick.is_none());
        assert_eq!(member.user.name, "user200");

        assert_eq!(api.member_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caller_supplied_fallback_avoids_the_user_lookup() {
        let (cache, api) = cache(MockApi::new());

        let payload_user = user(300);
        let resolved = cache
            .resolve(Snowflake::new(300), Some(&payload_user))
            .await
            .unwrap();
        assert_eq!(resolved.unwrap().user, payload_user);

        assert_eq!(api.member_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            api.user_calls.load(Ordering::SeqCst),
            0,
            "fallback user data must prevent the redundant lookup"
        );
    }

    #[tokio::test]
    async fn negative_result_is_cached_and_never_refetched() {
        let (cache, api) = cache(MockApi::new());

        assert!(cache.resolve(Snowflake::new(400), None).await.unwrap().is_none());
        assert!(cache.resolve(Snowflake::new(400), None).await.unwrap().is_none());
        assert!(cache.resolve(Snowflake::new(400), None).await.unwrap().is_none());

        assert_eq!(
            api.member_calls.load(Ordering::SeqCst),
            1,
            "confirmed-absent must not be re-fetched"
        );
        assert_eq!(api.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peek_never_triggers_a_fetch() {
        let (cache, api) = cache(MockApi::new().with_member(member(500, &[])));

        assert!(cache.peek(Snowflake::new(500)).await.is_none());
        assert_eq!(api.member_calls.load(Ordering::SeqCst), 0);

        cache.resolve(Snowflake::new(500), None).await.unwrap();
        assert!(cache.peek(Snowflake::new(500)).await.is_some());
        assert_eq!(api.member_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_errors_reach_every_waiter_and_are_not_cached() {
        let mut api = MockApi::new().with_member(member(600, &[]));
        api.fail_member_lookups = true;
        let api = Arc::new(api);
        let cache = Arc::new(MemberCache::new(
            api.clone(),
            Snowflake::new(1),
            CancellationToken::new(),
        ));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(Snowflake::new(600), None).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_err(), "all waiters observe the failure");
        }
        assert_eq!(api.member_calls.load(Ordering::SeqCst), 1);

        // The failure was not cached as a negative result; a later caller
        // retries the fetch.
        assert!(cache.resolve(Snowflake::new(600), None).await.is_err());
        assert_eq!(api.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_propagates_to_all_waiters() {
        let mut api = MockApi::new().with_member(member(700, &[]));
        api.delay = Duration::from_secs(30);
        let api = Arc::new(api);
        let cancel = CancellationToken::new();
        let cache = Arc::new(MemberCache::new(api, Snowflake::new(1), cancel.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(Snowflake::new(700), None).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.is_cancellation(), "waiters must see cancellation, got {err}");
        }
    }
}
