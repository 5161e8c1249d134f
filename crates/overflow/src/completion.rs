use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::Error;

/// Runs `future` as its own task, logs how it ended and cancels `token`.
///
/// The token is cancelled whether the task succeeds, fails or panics, so
/// anyone waiting on progress of the task is released. The task's result is
/// handed back; a panic surfaces as [`Error::Join`].
pub async fn task_completion_handler<F, T>(
    future: F,
    token: CancellationToken,
    task_name: &str,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(future);

    let result = match handle.await {
        Ok(Ok(value)) => {
            log::debug!("{} completed successfully", task_name);
            Ok(value)
        }
        Ok(Err(error)) => {
            log::error!("{} failed with error: {}", task_name, error);
            Err(error)
        }
        Err(join_error) => {
            log::error!("{} panicked or was cancelled: {:?}", task_name, join_error);
            Err(Error::Join(join_error))
        }
    };

    token.cancel();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lookup;

    #[tokio::test]
    async fn test_successful_completion() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let future = async { Ok::<u64, Error>(3) };

        let result = task_completion_handler(future, token.clone(), "test_task").await;
        assert_eq!(result.unwrap(), 3);
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Debug);
            assert_eq!(captured_logs[0].body, "test_task completed successfully");
        });
    }

    #[tokio::test]
    async fn test_error_completion() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let future = async { Err::<(), Error>(Error::UnknownEvent(Lookup::Handle(9))) };

        let result = task_completion_handler(future, token.clone(), "error_task").await;
        assert!(matches!(result, Err(Error::UnknownEvent(Lookup::Handle(9)))));
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert_eq!(
                captured_logs[0].body,
                "error_task failed with error: no event associated with fd=9"
            );
        });
    }

    #[tokio::test]
    async fn test_panic_completion() {
        testing_logger::setup();

        let token = CancellationToken::new();
        let future = async {
            panic!("test panic");
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        let result = task_completion_handler(future, token.clone(), "panic_task").await;
        assert!(matches!(result, Err(Error::Join(_))));
        assert!(token.is_cancelled());

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert!(captured_logs[0]
                .body
                .starts_with("panic_task panicked or was cancelled:"));
            assert!(captured_logs[0].body.contains("test panic"));
        });
    }
}
