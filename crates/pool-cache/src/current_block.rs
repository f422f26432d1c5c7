use {
    alloy_primitives::B256,
    anyhow::Result,
    std::{
        fmt::{self, Debug, Display, Formatter},
        sync::Arc,
        time::Duration,
    },
    tokio::sync::watch,
    tracing::Instrument,
};

/// Block information.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

pub type CurrentBlockStream = watch::Receiver<BlockInfo>;

/// Trait for abstracting the retrieval of the latest block from a node.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait BlockRetrieving: Debug + Send + Sync + 'static {
    async fn current_block(&self) -> Result<BlockInfo>;
}

#[derive(clap::Parser)]
#[group(skip)]
pub struct Arguments {
    /// How often the node is polled for a new block.
    #[clap(
        long,
        env,
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub block_stream_poll_interval: Duration,
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self {
            block_stream_poll_interval,
        } = self;

        writeln!(
            f,
            "block_stream_poll_interval: {:?}",
            block_stream_poll_interval
        )
    }
}

/// Creates a cloneable stream that yields the current block whenever it
/// changes.
///
/// The stream does not yield *every* block. If the node advances several
/// blocks between two polls only the newest one is observed. Block numbers
/// published on the stream never decrease, so reorgs to a block with the same
/// or a lower number are ignored.
///
/// Clone the returned receiver to share it between consumers; calling this
/// function again spawns another poller.
pub async fn current_block_stream(
    retriever: Arc<dyn BlockRetrieving>,
    poll_interval: Duration,
) -> Result<CurrentBlockStream> {
    let first_block = retriever.current_block().await?;
    tracing::debug!(number = %first_block.number, hash = ?first_block.hash, "polled block");

    let (sender, receiver) = watch::channel(first_block);
    let update_future = async move {
        let mut previous_block = first_block;
        loop {
            tokio::time::sleep(poll_interval).await;
            let block = match retriever.current_block().await {
                Ok(block) => block,
                Err(err) => {
                    tracing::warn!(?err, "failed to get current block");
                    continue;
                }
            };

            if block.hash == previous_block.hash || block.number <= previous_block.number {
                continue;
            }
            tracing::debug!(number = %block.number, hash = ?block.hash, "polled block");

            if sender.send(block).is_err() {
                tracing::debug!("exiting polling loop");
                break;
            }
            previous_block = block;
        }
    };

    tokio::task::spawn(update_future.instrument(tracing::info_span!("current_block_stream")));
    Ok(receiver)
}

/// Creates a block stream with an initial value that never observes any new
/// blocks. Useful for tests and "mock" components.
pub fn mock_single_block(block: BlockInfo) -> CurrentBlockStream {
    let (sender, receiver) = watch::channel(block);
    // Make sure the `sender` never drops so the `receiver` stays open.
    std::mem::forget(sender);
    receiver
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Mutex,
            atomic::{AtomicU64, Ordering},
        },
    };

    #[derive(Debug, Default)]
    struct ScriptedNode {
        calls: AtomicU64,
        blocks: Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl BlockRetrieving for ScriptedNode {
        async fn current_block(&self) -> Result<BlockInfo> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let blocks = self.blocks.lock().unwrap();
            let number = blocks[call.min(blocks.len() - 1)];
            Ok(BlockInfo {
                number,
                hash: B256::with_last_byte(number as u8),
                timestamp: number * 12,
            })
        }
    }

    #[tokio::test]
    async fn only_publishes_increasing_blocks() {
        let node = Arc::new(ScriptedNode {
            blocks: Mutex::new(vec![10, 10, 9, 12]),
            ..Default::default()
        });
        let mut stream = current_block_stream(node, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(stream.borrow().number, 10);

        stream.changed().await.unwrap();
        assert_eq!(stream.borrow().number, 12);
    }

    #[tokio::test]
    async fn fails_if_first_block_is_unavailable() {
        let mut node = MockBlockRetrieving::new();
        node.expect_current_block()
            .returning(|| Err(anyhow::anyhow!("node down")));
        assert!(
            current_block_stream(Arc::new(node), Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    #[test]
    fn mock_stream_stays_open() {
        let stream = mock_single_block(BlockInfo {
            number: 7,
            ..Default::default()
        });
        assert!(stream.has_changed().is_ok());
        assert_eq!(stream.borrow().number, 7);
    }
}
