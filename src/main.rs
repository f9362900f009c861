use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use otto_rewards::{
    config::{ConfigError, ParamsUpdate, ProgramConfig},
    ledger::{Amount, Digest32},
    program::{ProgramError, ReferralProgram},
    reward::{holdings_multiplier_bp, RewardError, RewardInput, RewardInputRaw},
    store::{JsonFileStore, StateStore, StoreError},
    tier::{
        check_eligibility, classify_tier, tier_progress, to_display_units, TierError,
        TierThresholds,
    },
    wallet::{
        claim_message, connection_message, generate_referral_code, holdings_message,
        params_message, sign_message, verify_wallet_connection, WalletAddress, WalletConnection,
        WalletError,
    },
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no program state at {0}; run `otto-rewards init` first")]
    StateMissing(PathBuf),
    #[error("program state already exists at {0}; pass --force to overwrite")]
    StateExists(PathBuf),
    #[error("invalid {name}: {reason}")]
    BadArgument { name: &'static str, reason: String },
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tier(#[from] TierError),
    #[error(transparent)]
    Reward(#[from] RewardError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "otto-rewards", version, about = "OTTO tier, eligibility and referral rewards")]
struct Cli {
    /// Program state file
    #[arg(long, global = true, default_value = "otto-state.json")]
    state: PathBuf,

    /// Program config (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,

    /// Unix timestamp to record instead of the wall clock
    #[arg(long, global = true)]
    now: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a balance into a tier
    Tier(BalanceArgs),
    /// Progress of a balance towards the next tier
    Progress(BalanceArgs),
    /// Compute a dynamic referral reward without touching state
    Reward(RewardArgs),
    /// Check referral eligibility for a balance
    Eligibility {
        #[arg(long)]
        holdings: Amount,
    },
    /// Verify a signed wallet connection and report its eligibility
    Connect {
        #[arg(long)]
        address: String,
        #[arg(long)]
        signature: String,
        #[arg(long)]
        timestamp: i64,
        #[arg(long)]
        holdings: Amount,
    },
    /// Create a fresh program state from the config
    Init {
        /// Wallet allowed to update program parameters
        #[arg(long)]
        authority: String,
        #[arg(long)]
        force: bool,
    },
    /// Credit the rewards pool
    Fund {
        #[arg(long)]
        amount: Amount,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Register a referrer; a code is generated when none is given
    Register {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        holdings: Amount,
    },
    /// Record a referrer's current holdings, signed by the referrer
    Holdings {
        #[arg(long)]
        code: String,
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        holdings: Amount,
        /// Timestamp covered by the signature
        #[arg(long)]
        timestamp: i64,
        /// base64 ed25519 signature over the holdings message
        #[arg(long)]
        signature: String,
    },
    /// Process a purchase, paying the referrer if a code is given
    Purchase {
        #[arg(long)]
        buyer: String,
        #[arg(long)]
        amount: Amount,
        #[arg(long)]
        code: Option<String>,
    },
    /// Claim the buyer reward of a purchase
    Claim {
        #[arg(long)]
        purchase: String,
        #[arg(long)]
        wallet: String,
        /// base64 ed25519 signature over the claim message
        #[arg(long)]
        signature: String,
    },
    /// Update program parameters, signed by the program authority
    Params {
        #[command(flatten)]
        params: ParamsArgs,
        #[arg(long)]
        wallet: String,
        /// Timestamp covered by the signature
        #[arg(long)]
        timestamp: i64,
        /// base64 ed25519 signature over the params message
        #[arg(long)]
        signature: String,
    },
    /// Referral stats for a code
    Stats {
        #[arg(long)]
        code: String,
    },
    /// Top referrers by rewards earned
    Leaderboard {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the program event log
    Events {
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Generate an ed25519 wallet key pair
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Sign a program message with a secret key
    Sign {
        /// 32-byte ed25519 secret key, hex
        #[arg(long)]
        sk_hex: String,
        #[command(subcommand)]
        message: SignCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SignCommand {
    /// Authorize claiming a purchase reward
    Claim {
        #[arg(long)]
        purchase: String,
    },
    /// Prove control of the wallet at a timestamp
    Connect {
        #[arg(long)]
        timestamp: i64,
    },
    /// Authorize a holdings update for a referral code
    Holdings {
        #[arg(long)]
        code: String,
        #[arg(long)]
        holdings: Amount,
        #[arg(long)]
        timestamp: i64,
    },
    /// Authorize a parameter update as program authority
    Params {
        #[command(flatten)]
        params: ParamsArgs,
        #[arg(long)]
        timestamp: i64,
    },
}

#[derive(Args, Debug)]
struct ParamsArgs {
    #[arg(long)]
    rewards_percentage_bp: Option<u16>,
    #[arg(long)]
    min_purchase_amount: Option<Amount>,
    /// bronze,silver,gold
    #[arg(long, value_delimiter = ',', num_args = 3)]
    thresholds: Option<Vec<Amount>>,
}

impl ParamsArgs {
    fn into_update(self) -> Result<ParamsUpdate, CliError> {
        let tier_thresholds = match self.thresholds.as_deref() {
            None => None,
            Some(&[bronze, silver, gold]) => Some([bronze, silver, gold]),
            Some(other) => {
                return Err(CliError::BadArgument {
                    name: "--thresholds",
                    reason: format!("expected 3 values, got {}", other.len()),
                })
            }
        };
        Ok(ParamsUpdate {
            rewards_percentage_bp: self.rewards_percentage_bp,
            min_purchase_amount: self.min_purchase_amount,
            tier_thresholds,
        })
    }
}

#[derive(Args, Debug)]
struct BalanceArgs {
    #[arg(long)]
    balance: Amount,
    /// Override the configured thresholds: bronze,silver,gold
    #[arg(long, value_delimiter = ',', num_args = 3)]
    thresholds: Option<Vec<Amount>>,
}

#[derive(Args, Debug)]
struct RewardArgs {
    #[arg(long, allow_negative_numbers = true)]
    base_rate_bp: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    referrer_holdings: i128,
    #[arg(long, allow_negative_numbers = true)]
    purchase_amount: i128,
    #[arg(long, allow_negative_numbers = true, default_value_t = 10_000)]
    holding_ratio_bp: i64,
    #[arg(long, allow_negative_numbers = true)]
    min_holdings: Option<i128>,
}

#[derive(Serialize)]
struct RewardReport {
    input: RewardInput,
    multiplier_bp: u16,
    reward: Amount,
    reward_tokens: f64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_wallet(value: &str) -> Result<WalletAddress, CliError> {
    Ok(WalletAddress::parse(value)?)
}

fn parse_digest(name: &'static str, value: &str) -> Result<Digest32, CliError> {
    Digest32::from_hex(value).map_err(|e| CliError::BadArgument {
        name,
        reason: e.to_string(),
    })
}

fn thresholds_arg(
    values: Option<Vec<Amount>>,
    config: &ProgramConfig,
) -> Result<TierThresholds, CliError> {
    match values.as_deref() {
        None => Ok(config.thresholds),
        Some(&[bronze, silver, gold]) => Ok(TierThresholds::new(bronze, silver, gold)?),
        Some(other) => Err(CliError::BadArgument {
            name: "--thresholds",
            reason: format!("expected 3 values, got {}", other.len()),
        }),
    }
}

/// Signed CLI values narrowed to engine input; config fills the optional
/// rate and minimum.
fn reward_input(args: &RewardArgs, config: &ProgramConfig) -> Result<RewardInput, RewardError> {
    RewardInput::try_from(RewardInputRaw {
        base_rate_bp: args
            .base_rate_bp
            .unwrap_or(config.base_reward_rate_bp.into()),
        referrer_holdings: args.referrer_holdings,
        purchase_amount: args.purchase_amount,
        holding_ratio_bp: args.holding_ratio_bp,
        min_holdings_for_referral: args
            .min_holdings
            .unwrap_or(config.min_holdings_for_referral.into()),
    })
}

fn load_program(store: &JsonFileStore) -> Result<ReferralProgram, CliError> {
    store
        .load()?
        .ok_or_else(|| CliError::StateMissing(store.path().to_path_buf()))
}

/// Load, mutate, save. Nothing is written when `op` fails.
fn with_program<T>(
    store: &JsonFileStore,
    op: impl FnOnce(&mut ReferralProgram) -> Result<T, CliError>,
) -> Result<T, CliError> {
    let mut program = load_program(store)?;
    let out = op(&mut program)?;
    store.save(&program)?;
    Ok(out)
}

fn keygen(out_dir: &Path) -> Result<WalletAddress, CliError> {
    fs::create_dir_all(out_dir)?;
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let address = WalletAddress::from_verifying_key(&sk.verifying_key());
    fs::write(out_dir.join("sk.hex"), hex::encode(sk_bytes))?;
    fs::write(out_dir.join("pk.hex"), address.as_str())?;
    Ok(address)
}

fn signing_key(sk_hex: &str) -> Result<SigningKey, CliError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(sk_hex.trim(), &mut bytes).map_err(|e| CliError::BadArgument {
        name: "--sk-hex",
        reason: e.to_string(),
    })?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = ProgramConfig::load_or_default(cli.config.as_deref())?;
    let store = JsonFileStore::new(&cli.state);
    let now = cli.now.unwrap_or_else(unix_now);

    match cli.command {
        Command::Tier(args) => {
            let thresholds = thresholds_arg(args.thresholds, &config)?;
            println!("{}", classify_tier(args.balance, &thresholds));
        }
        Command::Progress(args) => {
            let thresholds = thresholds_arg(args.thresholds, &config)?;
            print_json(&tier_progress(args.balance, &thresholds))?;
        }
        Command::Reward(args) => {
            let input = reward_input(&args, &config)?;
            let reward = input.compute();
            print_json(&RewardReport {
                input,
                multiplier_bp: holdings_multiplier_bp(
                    input.referrer_holdings,
                    input.min_holdings_for_referral,
                ),
                reward,
                reward_tokens: to_display_units(reward),
            })?;
        }
        Command::Eligibility { holdings } => {
            print_json(&check_eligibility(
                holdings,
                config.min_holdings_for_referral,
            ))?;
        }
        Command::Connect {
            address,
            signature,
            timestamp,
            holdings,
        } => {
            let connection = WalletConnection {
                address: parse_wallet(&address)?,
                signature,
                timestamp,
            };
            verify_wallet_connection(&connection)?;
            info!(wallet = %connection.address, "wallet connection verified");
            print_json(&check_eligibility(
                holdings,
                config.min_holdings_for_referral,
            ))?;
        }
        Command::Init { authority, force } => {
            if store.path().exists() && !force {
                return Err(CliError::StateExists(store.path().to_path_buf()));
            }
            let program = ReferralProgram::new(config, parse_wallet(&authority)?, now)?;
            store.save(&program)?;
            println!("initialized {}", store.path().display());
        }
        Command::Fund { amount, memo } => {
            let pool = with_program(&store, |p| {
                p.fund_pool(amount, memo, now)?;
                Ok(p.ledger().pool_balance())
            })?;
            println!("rewards pool balance: {pool}");
        }
        Command::Register {
            wallet,
            code,
            holdings,
        } => {
            let wallet = parse_wallet(&wallet)?;
            let code = code.unwrap_or_else(|| generate_referral_code(&mut OsRng));
            let account = with_program(&store, |p| {
                Ok(p.register_referrer(wallet, code, holdings, now)?.clone())
            })?;
            print_json(&account)?;
        }
        Command::Holdings {
            code,
            wallet,
            holdings,
            timestamp,
            signature,
        } => {
            let wallet = parse_wallet(&wallet)?;
            let account = with_program(&store, |p| {
                Ok(p
                    .update_holdings_signed(&code, &wallet, holdings, &signature, timestamp)?
                    .clone())
            })?;
            print_json(&account)?;
        }
        Command::Purchase {
            buyer,
            amount,
            code,
        } => {
            let buyer = parse_wallet(&buyer)?;
            let outcome = with_program(&store, |p| {
                Ok(p.process_purchase(buyer, amount, code.as_deref(), now)?)
            })?;
            print_json(&outcome)?;
        }
        Command::Claim {
            purchase,
            wallet,
            signature,
        } => {
            let purchase = parse_digest("--purchase", &purchase)?;
            let wallet = parse_wallet(&wallet)?;
            let amount = with_program(&store, |p| {
                Ok(p.claim_rewards_signed(&purchase, &wallet, &signature, now)?)
            })?;
            println!("claimed {amount} ({:.6} OTTO)", to_display_units(amount));
        }
        Command::Params {
            params,
            wallet,
            timestamp,
            signature,
        } => {
            let update = params.into_update()?;
            let wallet = parse_wallet(&wallet)?;
            let config = with_program(&store, |p| {
                p.update_params_signed(&update, &wallet, &signature, timestamp)?;
                Ok(p.config().clone())
            })?;
            print_json(&config)?;
        }
        Command::Stats { code } => {
            let program = load_program(&store)?;
            print_json(&program.stats(&code)?)?;
        }
        Command::Leaderboard { limit } => {
            let program = load_program(&store)?;
            print_json(&program.leaderboard(limit))?;
        }
        Command::Events { tail } => {
            let program = load_program(&store)?;
            let events = program.events();
            let skip = tail.map_or(0, |n| events.len().saturating_sub(n));
            for event in &events[skip..] {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        Command::Keygen { out_dir } => {
            let address = keygen(&out_dir)?;
            println!("keypair written to {} (address {address})", out_dir.display());
        }
        Command::Sign { sk_hex, message } => {
            let sk = signing_key(&sk_hex)?;
            let message = match message {
                SignCommand::Claim { purchase } => {
                    claim_message(&parse_digest("--purchase", &purchase)?)
                }
                SignCommand::Connect { timestamp } => connection_message(
                    &WalletAddress::from_verifying_key(&sk.verifying_key()),
                    timestamp,
                ),
                SignCommand::Holdings {
                    code,
                    holdings,
                    timestamp,
                } => holdings_message(&code, holdings, timestamp),
                SignCommand::Params { params, timestamp } => {
                    params_message(&params.into_update()?, timestamp)
                }
            };
            println!("{}", sign_message(&sk, &message));
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli) {
        debug!(?err, "command failed");
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}
