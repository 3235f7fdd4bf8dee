use std::thread::sleep;
use std::time::Duration;

/// Retries `f` until it succeeds or `max_attempts` is reached, sleeping
/// `interval` between attempts. Returns the first success or the last error.
pub fn retry<F, T, E>(max_attempts: usize, interval: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut last_err = None;
    for _ in 0..max_attempts {
        match f() {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                sleep(interval);
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_first_try() {
        let result: Result<&str, &str> = retry(3, Duration::from_millis(1), || Ok("done"));
        assert_eq!(result, Ok("done"));
    }

    #[test]
    fn returns_last_error_when_exhausted() {
        let result: Result<&str, &str> = retry(3, Duration::from_millis(1), || Err("nope"));
        assert_eq!(result, Err("nope"));
    }

    #[test]
    fn succeeds_on_later_attempt() {
        let mut attempts = 0;
        let result = retry(3, Duration::from_millis(1), || {
            attempts += 1;
            if attempts < 3 {
                Err("try again")
            } else {
                Ok("finally")
            }
        });
        assert_eq!(result, Ok("finally"));
    }
}
