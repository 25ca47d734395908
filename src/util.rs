pub mod serde_helper {
    use core::fmt;
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::ops::Deref;

    pub(crate) mod optional_offset_date_time {
        use serde::{self, Deserializer, Serializer};
        use std::option::Option;
        use time::OffsetDateTime;
        use time::serde::rfc3339;

        pub fn serialize<S>(
            input: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match input {
                None => serializer.serialize_none(),
                Some(time) => rfc3339::serialize(time, serializer),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            rfc3339::deserialize(deserializer).map(Some)
        }
    }

    /// A serde-deserializable type that takes in a byte array and keeps it
    /// unchanged. Used for the one ACME response that is not JSON (the
    /// certificate chain download).
    #[derive(Debug)]
    pub struct PassthroughBytes {
        inner: Vec<u8>,
    }

    struct PassthroughBytesVisitor;

    impl Visitor<'_> for PassthroughBytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte array")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v)
        }
    }

    impl<'de> Deserialize<'de> for PassthroughBytes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let bytes: Vec<u8> = deserializer.deserialize_byte_buf(PassthroughBytesVisitor)?;
            Ok(Self { inner: bytes })
        }
    }

    impl Deref for PassthroughBytes {
        type Target = Vec<u8>;

        fn deref(&self) -> &Self::Target {
            &self.inner
        }
    }
}

pub(crate) mod poll {
    use std::time::Duration;

    /// A bounded polling schedule: a fixed number of attempts, with a per-step
    /// delay computed from the number of attempts remaining.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct PollSchedule {
        pub attempts: u32,
        delay_fn: fn(remaining: u32) -> Duration,
    }

    impl PollSchedule {
        pub(crate) const fn new(attempts: u32, delay_fn: fn(u32) -> Duration) -> Self {
            Self { attempts, delay_fn }
        }

        pub(crate) fn delay(&self, remaining: u32) -> Duration {
            (self.delay_fn)(remaining)
        }
    }

    /// Fetches a resource until `is_terminal` accepts it or the schedule's
    /// attempt budget is exhausted. The first fetch happens immediately;
    /// `Ok(None)` means the budget ran out without reaching a terminal state.
    pub(crate) async fn poll_until<T, E, F, Fut, P>(
        schedule: PollSchedule,
        mut fetch: F,
        mut is_terminal: P,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&T) -> bool,
    {
        let mut remaining = schedule.attempts;
        loop {
            let value = fetch().await?;
            if is_terminal(&value) {
                return Ok(Some(value));
            }
            if remaining == 0 {
                return Ok(None);
            }
            tokio::time::sleep(schedule.delay(remaining)).await;
            remaining -= 1;
        }
    }
}

#[allow(clippy::missing_panics_doc)]
pub fn current_time_truncated() -> time::OffsetDateTime {
    let now = time::OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap(/* unreachable */)
}

#[cfg(test)]
mod tests {
    use super::poll::{PollSchedule, poll_until};
    use std::convert::Infallible;
    use std::time::Duration;

    const INSTANT: PollSchedule = PollSchedule::new(3, |_| Duration::from_millis(1));

    #[tokio::test]
    async fn test_poll_until_terminal_on_first_fetch() {
        let result: Result<Option<u32>, Infallible> =
            poll_until(INSTANT, || async { Ok(42) }, |v| *v == 42).await;
        assert_eq!(result.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_poll_until_exhausts_budget() {
        let mut calls = 0;
        let result: Result<Option<u32>, Infallible> = poll_until(
            INSTANT,
            || {
                calls += 1;
                async { Ok(0) }
            },
            |v| *v == 42,
        )
        .await;
        assert_eq!(result.unwrap(), None);
        // initial fetch plus one per budgeted attempt
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_poll_until_reaches_terminal_mid_budget() {
        let mut calls = 0;
        let result: Result<Option<u32>, Infallible> = poll_until(
            INSTANT,
            || {
                calls += 1;
                let value = calls;
                async move { Ok(value) }
            },
            |v| *v == 2,
        )
        .await;
        assert_eq!(result.unwrap(), Some(2));
        assert_eq!(calls, 2);
    }
}
