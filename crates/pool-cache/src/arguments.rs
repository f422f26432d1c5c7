//! Command line configuration of the pool cache for the binaries embedding it.

use {
    crate::{
        address::{Create2Deriver, PoolDeployment},
        key::ChainId,
        query::PoolCacheConfig,
    },
    anyhow::{Context, Result},
    std::{
        fmt::{self, Display, Formatter},
        str::FromStr,
        time::Duration,
    },
    tracing::level_filters::LevelFilter,
};

#[derive(clap::Parser)]
#[group(skip)]
pub struct LoggingArguments {
    #[clap(long, env, default_value = "warn,pool_cache=debug")]
    pub log_filter: String,

    #[clap(long, env, default_value = "error")]
    pub log_stderr_threshold: LevelFilter,
}

impl LoggingArguments {
    pub fn initialize(&self) {
        observe::tracing::initialize(&self.log_filter, self.log_stderr_threshold);
    }
}

impl Display for LoggingArguments {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self {
            log_filter,
            log_stderr_threshold,
        } = self;

        writeln!(f, "log_filter: {}", log_filter)?;
        writeln!(f, "log_stderr_threshold: {}", log_stderr_threshold)?;
        Ok(())
    }
}

#[derive(clap::Parser)]
#[group(skip)]
pub struct Arguments {
    #[clap(flatten)]
    pub logging: LoggingArguments,

    #[clap(flatten)]
    pub current_block: crate::current_block::Arguments,

    /// Refetch every queried pool once per new block by default.
    #[clap(long, env, action = clap::ArgAction::Set, default_value = "false")]
    pub pool_cache_refresh_on_block: bool,

    /// Refetch queried pools whose state is older than this by default.
    #[clap(long, env, value_parser = humantime::parse_duration)]
    pub pool_cache_ttl: Option<Duration>,

    /// Pool fetches taking longer than this are considered failed.
    #[clap(long, env, default_value = "10s", value_parser = humantime::parse_duration)]
    pub pool_cache_fetch_timeout: Duration,

    /// Base delay before a failed pool is retried. Doubles with every
    /// consecutive failure. Failed pools are retried like any other pool if
    /// unset.
    #[clap(long, env, value_parser = humantime::parse_duration)]
    pub pool_cache_failure_backoff: Option<Duration>,

    /// Additional or overriding pool deployments in the following format:
    /// `<CHAIN_ID>|<FACTORY>|<INIT_CODE_DIGEST>,<CHAIN_ID>|...`. Uniswap V3
    /// deployments of mainnet, Optimism, Polygon and Arbitrum are known
    /// without configuration.
    #[clap(long, env, use_value_delimiter = true)]
    pub pool_deployments: Vec<PoolDeploymentArgument>,
}

impl Arguments {
    pub fn config(&self) -> PoolCacheConfig {
        PoolCacheConfig {
            refresh_on_block: self.pool_cache_refresh_on_block,
            ttl: self.pool_cache_ttl,
            fetch_timeout: Some(self.pool_cache_fetch_timeout),
            failure_backoff: self.pool_cache_failure_backoff,
        }
    }

    pub fn deriver(&self) -> Create2Deriver {
        self.pool_deployments
            .iter()
            .fold(Create2Deriver::uniswap_v3(), |deriver, argument| {
                deriver.with_deployment(argument.chain_id, argument.deployment)
            })
    }
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self {
            logging,
            current_block,
            pool_cache_refresh_on_block,
            pool_cache_ttl,
            pool_cache_fetch_timeout,
            pool_cache_failure_backoff,
            pool_deployments,
        } = self;

        write!(f, "{}", logging)?;
        write!(f, "{}", current_block)?;
        writeln!(
            f,
            "pool_cache_refresh_on_block: {}",
            pool_cache_refresh_on_block
        )?;
        writeln!(f, "pool_cache_ttl: {:?}", pool_cache_ttl)?;
        writeln!(f, "pool_cache_fetch_timeout: {:?}", pool_cache_fetch_timeout)?;
        writeln!(
            f,
            "pool_cache_failure_backoff: {:?}",
            pool_cache_failure_backoff
        )?;
        display_list(f, "pool_deployments", pool_deployments)?;
        Ok(())
    }
}

fn display_list<T>(
    f: &mut Formatter<'_>,
    name: &str,
    iter: impl IntoIterator<Item = T>,
) -> fmt::Result
where
    T: Display,
{
    write!(f, "{name}: [")?;
    for (i, t) in iter.into_iter().enumerate() {
        if i != 0 {
            f.write_str(", ")?;
        }
        write!(f, "{t}")?;
    }
    writeln!(f, "]")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolDeploymentArgument {
    pub chain_id: ChainId,
    pub deployment: PoolDeployment,
}

impl FromStr for PoolDeploymentArgument {
    type Err = anyhow::Error;

    fn from_str(argument: &str) -> Result<Self> {
        let mut parts = argument.splitn(3, '|');
        let chain_id = parts.next().context("missing chain id")?;
        let factory = parts.next().context("missing factory address")?;
        let init_code_digest = parts.next().context("missing init code digest")?;
        Ok(Self {
            chain_id: chain_id
                .parse()
                .with_context(|| format!("invalid chain id {chain_id:?}"))?,
            deployment: PoolDeployment {
                factory: factory
                    .parse()
                    .with_context(|| format!("invalid factory address {factory:?}"))?,
                init_code_digest: init_code_digest
                    .parse()
                    .with_context(|| format!("invalid init code digest {init_code_digest:?}"))?,
            },
        })
    }
}

impl Display for PoolDeploymentArgument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{:?}",
            self.chain_id, self.deployment.factory, self.deployment.init_code_digest
        )
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            address::{AddressDeriving, UNISWAP_V3_INIT_CODE_DIGEST},
            key::{CacheKey, FeeTier, Token},
        },
        alloy_primitives::{Address, B256},
        clap::Parser,
        testlib::tokens,
    };

    const DEPLOYMENT: &str = "100|0xe32F7dD7e3f098D518ff19A22d5f028e076489B1|\
                              0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";

    #[test]
    fn parses_defaults() {
        let args = Arguments::try_parse_from(["pool-cache"]).unwrap();

        assert_eq!(args.logging.log_stderr_threshold, LevelFilter::ERROR);
        assert_eq!(
            args.current_block.block_stream_poll_interval,
            Duration::from_secs(1)
        );
        assert_eq!(
            args.config(),
            PoolCacheConfig {
                refresh_on_block: false,
                ttl: None,
                fetch_timeout: Some(Duration::from_secs(10)),
                failure_backoff: None,
            }
        );
        assert!(args.pool_deployments.is_empty());
    }

    #[test]
    fn parses_durations_and_flags() {
        let args = Arguments::try_parse_from([
            "pool-cache",
            "--pool-cache-refresh-on-block=true",
            "--pool-cache-ttl=30s",
            "--pool-cache-fetch-timeout=500ms",
            "--pool-cache-failure-backoff=2s",
            "--block-stream-poll-interval=250ms",
        ])
        .unwrap();

        assert_eq!(
            args.config(),
            PoolCacheConfig {
                refresh_on_block: true,
                ttl: Some(Duration::from_secs(30)),
                fetch_timeout: Some(Duration::from_millis(500)),
                failure_backoff: Some(Duration::from_secs(2)),
            }
        );
        assert_eq!(
            args.current_block.block_stream_poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn parses_pool_deployments() {
        let argument = PoolDeploymentArgument::from_str(DEPLOYMENT).unwrap();
        assert_eq!(
            argument,
            PoolDeploymentArgument {
                chain_id: 100,
                deployment: PoolDeployment {
                    factory: "0xe32F7dD7e3f098D518ff19A22d5f028e076489B1"
                        .parse()
                        .unwrap(),
                    init_code_digest: UNISWAP_V3_INIT_CODE_DIGEST,
                },
            }
        );
        assert_eq!(
            argument.to_string().parse::<PoolDeploymentArgument>().unwrap(),
            argument
        );

        for invalid in [
            "",
            "100",
            "100|0xe32F7dD7e3f098D518ff19A22d5f028e076489B1",
            "gnosis|0xe32F7dD7e3f098D518ff19A22d5f028e076489B1|0x00",
            "100|factory|0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54",
        ] {
            assert!(PoolDeploymentArgument::from_str(invalid).is_err(), "{invalid}");
        }
    }

    #[test]
    fn configured_deployments_extend_known_ones() {
        let second = format!("5|{}|{:?}", Address::repeat_byte(5), B256::repeat_byte(5));
        let args = Arguments::try_parse_from([
            "pool-cache",
            "--pool-deployments",
            &format!("{DEPLOYMENT},{second}"),
        ])
        .unwrap();
        assert_eq!(args.pool_deployments.len(), 2);

        let deriver = args.deriver();
        let key = |chain_id| {
            CacheKey::canonicalize(
                Some(chain_id),
                Some(&Token::new(chain_id, tokens::USDC, 6)),
                Some(&Token::new(chain_id, tokens::WETH, 18)),
                Some(FeeTier::Low),
            )
            .unwrap()
        };
        assert!(deriver.derive(&key(1)).is_ok());
        assert!(deriver.derive(&key(5)).is_ok());
        assert!(deriver.derive(&key(100)).is_ok());
        assert!(deriver.derive(&key(56)).is_err());
        assert_ne!(
            deriver.derive(&key(100)).unwrap(),
            Create2Deriver::uniswap_v3().derive(&key(1)).unwrap()
        );
        // Mainnet keeps its built in deployment.
        assert_eq!(
            deriver.derive(&key(1)),
            Create2Deriver::uniswap_v3().derive(&key(1))
        );
    }

    #[test]
    fn initializes_logging() {
        let args =
            Arguments::try_parse_from(["pool-cache", "--log-filter=warn,pool_cache=trace"]).unwrap();
        assert_eq!(args.logging.log_filter, "warn,pool_cache=trace");

        args.logging.initialize();
        assert!(tracing::dispatcher::has_been_set());
    }

    #[test]
    fn displays_all_arguments() {
        let args =
            Arguments::try_parse_from(["pool-cache", "--pool-deployments", DEPLOYMENT]).unwrap();
        let display = args.to_string();
        for name in [
            "log_filter",
            "block_stream_poll_interval",
            "pool_cache_refresh_on_block",
            "pool_cache_ttl",
            "pool_cache_fetch_timeout",
            "pool_cache_failure_backoff",
            "pool_deployments: [100|",
        ] {
            assert!(display.contains(name), "{name} missing from {display}");
        }
    }
}
