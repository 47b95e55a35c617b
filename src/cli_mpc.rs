use bufstream::BufStream;
use redis::Commands;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zkchannels_protocol::database::{RedisDatabase, StateDatabase};
use zkchannels_protocol::mpc;
use zkchannels_protocol::mpc_session::{serve_mpc, LocalMpcCoordinator, TcpMpcCoordinator};
use zkchannels_protocol::wire::{ProtocolMessage, ProtocolResponse};
use zkchannels_protocol::{ZkChannelError, ZkResult};

static TX_FEE_INFO_KEY: &str = "tx_fee_info";

macro_rules! measure_one_arg {
    ($x: expr) => {{
        let s = Instant::now();
        let res = $x;
        let e = s.elapsed();
        (res, e.as_millis())
    }};
}

macro_rules! print_error_result {
    ($e:expr, $label:tt) => {
        match $e {
            Ok(_) => (),
            Err(err) => println!("{} failed with error: {}", $label, err),
        }
    };
}

macro_rules! create_connection {
    ($e: expr) => {
        &mut Conn::new(&$e.own_ip, &$e.own_port, &$e.other_ip, &$e.other_port)?
    };
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZKChannelConfig {
    version: u8,
    db_url: String,
    mpc_addr: String,
}

impl Default for ZKChannelConfig {
    fn default() -> Self {
        ZKChannelConfig {
            version: 0,
            db_url: "redis://127.0.0.1/".to_string(),
            mpc_addr: "127.0.0.1:12345".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
enum Party {
    MERCH,
    CUST,
}

impl FromStr for Party {
    type Err = serde_json::error::Error;
    fn from_str(s: &str) -> Result<Party, serde_json::error::Error> {
        Ok(serde_json::from_str(&format!("\"{}\"", s))?)
    }
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct SetFees {
    #[structopt(short = "d", long = "bal-min-cust", default_value = "546")]
    bal_min_cust: i64,
    #[structopt(short = "e", long = "bal-min-merch", default_value = "546")]
    bal_min_merch: i64,
    #[structopt(short = "v", long = "val-cpfp", default_value = "1000")]
    val_cpfp: i64,
    #[structopt(short = "f", long = "fee-cc", default_value = "1000")]
    fee_cc: i64,
    #[structopt(short = "m", long = "min-fee", default_value = "0")]
    min_fee: i64,
    #[structopt(short = "s", long = "max-fee", default_value = "10000")]
    max_fee: i64,
    #[structopt(short = "g", long = "fee-mc", default_value = "1000")]
    fee_mc: i64,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct Open {
    #[structopt(long = "party")]
    party: Party,
    #[structopt(short = "c", long = "cust-bal", default_value = "0")]
    cust_bal: i64,
    #[structopt(short = "m", long = "merch-bal", default_value = "0")]
    merch_bal: i64,
    #[structopt(short = "i", long = "own-ip", default_value = "127.0.0.1")]
    own_ip: String,
    #[structopt(short = "p", long = "own-port")]
    own_port: String,
    #[structopt(short = "j", long = "other-ip", default_value = "127.0.0.1")]
    other_ip: String,
    #[structopt(short = "q", long = "other-port")]
    other_port: String,
    #[structopt(short = "b", long = "self-delay", default_value = "1487")]
    self_delay: u16,
    #[structopt(short = "n", long = "channel-name", default_value = "")]
    channel_name: String,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct Init {
    #[structopt(long = "party")]
    party: Party,
    #[structopt(long = "txid")]
    txid: Option<String>,
    #[structopt(long = "index")]
    index: Option<u32>,
    #[structopt(short = "a", long = "input-sats")]
    input_sats: Option<i64>,
    #[structopt(short = "i", long = "own-ip", default_value = "127.0.0.1")]
    own_ip: String,
    #[structopt(short = "p", long = "own-port")]
    own_port: String,
    #[structopt(short = "j", long = "other-ip", default_value = "127.0.0.1")]
    other_ip: String,
    #[structopt(short = "q", long = "other-port")]
    other_port: String,
    #[structopt(short = "f", long = "tx-fee", default_value = "1000")]
    tx_fee: i64,
    #[structopt(short = "n", long = "channel-name", default_value = "")]
    channel_name: String,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct Activate {
    #[structopt(long = "party")]
    party: Party,
    #[structopt(short = "i", long = "own-ip", default_value = "127.0.0.1")]
    own_ip: String,
    #[structopt(short = "p", long = "own-port")]
    own_port: String,
    #[structopt(short = "j", long = "other-ip", default_value = "127.0.0.1")]
    other_ip: String,
    #[structopt(short = "q", long = "other-port")]
    other_port: String,
    #[structopt(short = "n", long = "channel-name", default_value = "")]
    channel_name: String,
    #[structopt(short = "b")]
    benchmark: bool,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct Pay {
    #[structopt(long = "party")]
    party: Party,
    #[structopt(short = "a", long = "amount", allow_hyphen_values = true)]
    amount: Option<i64>,
    #[structopt(short = "r", long = "justification")]
    justification: Option<String>,
    #[structopt(short = "i", long = "own-ip", default_value = "127.0.0.1")]
    own_ip: String,
    #[structopt(short = "p", long = "own-port")]
    own_port: String,
    #[structopt(short = "j", long = "other-ip", default_value = "127.0.0.1")]
    other_ip: String,
    #[structopt(short = "q", long = "other-port")]
    other_port: String,
    #[structopt(short = "n", long = "channel-name", default_value = "")]
    channel_name: String,
    #[structopt(short = "b")]
    benchmark: bool,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub struct Close {
    #[structopt(long = "party")]
    party: Party,
    #[structopt(short = "f", long = "file")]
    file: PathBuf,
    #[structopt(short = "e", long = "from-merch")]
    from_merch_close: bool,
    #[structopt(short = "n", long = "channel-id", default_value = "")]
    channel_id: String,
}

#[derive(Clone, Debug, StructOpt, Deserialize)]
pub enum Command {
    #[structopt(name = "setfees")] // for setting transaction fees for zkchannels
    SETFEES(SetFees),
    #[structopt(name = "mpc")] // runs the mpc rendezvous both parties connect to
    MPC,
    #[structopt(name = "open")] // for initializing channel state and cust/merch state
    OPEN(Open),
    #[structopt(name = "init")] // for creating/signing txs between cust/merch
    INIT(Init),
    #[structopt(name = "activate")] // for activating channel
    ACTIVATE(Activate),
    #[structopt(name = "unlink")] // for unlinking channel
    UNLINK(Pay),
    #[structopt(name = "pay")] // for making a payment on an existing channel
    PAY(Pay),
    #[structopt(name = "close")] // for generating closing txs
    CLOSE(Close),
}

#[derive(StructOpt, Debug)]
#[structopt(name = "zkchannels-mpc")]
struct Cli {
    #[structopt(
        subcommand,
        help = "Options: setfees, mpc, open, init, activate, unlink, pay, or close"
    )]
    command: Command,
}

pub fn get_merch_db_connection(db_url: String) -> ZkResult<RedisDatabase> {
    RedisDatabase::new("cli", db_url)
}

pub fn connect_db(url: &str) -> ZkResult<redis::Connection> {
    let client = redis::Client::open(url)?;
    Ok(client.get_connection()?)
}

pub fn write_file(file_name: &str, content: String) -> ZkResult<()> {
    let mut file = File::create(file_name)?;
    file.write_all(content.as_ref())?;
    Ok(())
}

pub fn write_pathfile(path_buf: PathBuf, content: String) -> ZkResult<()> {
    let mut file = File::create(path_buf)?;
    file.write_all(content.as_ref())?;
    Ok(())
}

pub fn store_file_in_db(conn: &mut redis::Connection, key: &str, field_name: &str, json_blob: &str) -> ZkResult<bool> {
    let s: i32 = conn.hset(key, field_name, json_blob)?;
    Ok(s != 0)
}

pub fn get_file_from_db(conn: &mut redis::Connection, key: &str, field_name: &str) -> ZkResult<String> {
    let blob: Option<String> = conn.hget(key, field_name)?;
    blob.ok_or_else(|| ZkChannelError::NotFound(format!("{} in {}", field_name, key)))
}

/// Stored fees, or the defaults when `setfees` was never run.
pub fn load_tx_fee_info(db_conn: &mut redis::Connection) -> ZkResult<mpc::TransactionFeeInfo> {
    match get_file_from_db(db_conn, "cli:tx_fee", TX_FEE_INFO_KEY) {
        Ok(ser_tx_fee_info) => Ok(serde_json::from_str(&ser_tx_fee_info)?),
        Err(ZkChannelError::NotFound(_)) => Ok(mpc::TransactionFeeInfo::default()),
        Err(e) => Err(e),
    }
}

pub fn store_tx_fee_info(db_url: &str, tx_fee_info: &mpc::TransactionFeeInfo) -> ZkResult<()> {
    let mut db_conn = connect_db(db_url)?;
    let tx_fee_info_str = serde_json::to_string(tx_fee_info)?;
    store_file_in_db(&mut db_conn, "cli:tx_fee", TX_FEE_INFO_KEY, &tx_fee_info_str)?;
    Ok(())
}

fn unexpected<T>(msg: ProtocolMessage) -> ZkResult<T> {
    Err(ZkChannelError::Validation(format!("unexpected message: {:?}", msg)))
}

pub struct Conn {
    pub in_addr: SocketAddr,
    pub out_addr: SocketAddr,
}

impl Conn {
    pub fn new(own_ip: &str, own_port: &str, other_ip: &str, other_port: &str) -> ZkResult<Conn> {
        let parse = |ip: &str, port: &str| {
            SocketAddr::from_str(&format!("{}:{}", ip, port))
                .map_err(|e| ZkChannelError::Validation(format!("bad address {}:{}: {}", ip, port, e)))
        };
        Ok(Conn {
            in_addr: parse(own_ip, own_port)?,
            out_addr: parse(other_ip, other_port)?,
        })
    }

    pub fn send(&mut self, msg: &[String]) -> ZkResult<()> {
        let mut last_err = None;
        for i in 1..6 {
            match TcpStream::connect(self.out_addr) {
                Ok(stream) => {
                    let mut buf_stream = BufStream::new(stream);
                    for msg0 in msg {
                        buf_stream.write_all((msg0.to_owned() + "\n").as_ref())?;
                    }
                    buf_stream.write_all(b"end\n")?;
                    buf_stream.flush()?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(try_no = i, error = %e, "failed to connect");
                    last_err = Some(e);
                    sleep(Duration::from_secs(5))
                }
            }
        }
        Err(last_err.map(ZkChannelError::from).unwrap_or_else(|| ZkChannelError::Remote("peer unreachable".to_string())))
    }

    pub fn wait_for(&mut self) -> ZkResult<Vec<String>> {
        let listener = TcpListener::bind(self.in_addr)?;
        let (stream, _) = listener.accept()?;
        let mut buf_stream = BufStream::new(stream);
        let mut out: Vec<String> = vec![];
        loop {
            let mut reads = String::new();
            if buf_stream.read_line(&mut reads)? == 0 || reads == "end\n" {
                return Ok(out);
            }
            reads.pop();
            out.push(reads);
        }
    }

    pub fn send_msg(&mut self, msg: &ProtocolResponse<ProtocolMessage>) -> ZkResult<()> {
        self.send(&[serde_json::to_string(msg)?])
    }

    /// Replies with `r`, or with the error so the peer stops before touching
    /// its state. The error is passed back to the caller either way.
    pub fn reply(&mut self, r: ZkResult<ProtocolMessage>) -> ZkResult<()> {
        match r {
            Ok(msg) => self.send_msg(&ProtocolResponse::ok(msg)),
            Err(e) => {
                self.send_msg(&ProtocolResponse::err(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub fn wait_for_msg(&mut self) -> ZkResult<ProtocolMessage> {
        let lines = self.wait_for()?;
        let line = lines
            .first()
            .ok_or_else(|| ZkChannelError::Remote("empty message".to_string()))?;
        let resp: ProtocolResponse<ProtocolMessage> = serde_json::from_str(line)?;
        resp.into_result()
    }

    pub fn send_and_wait(&mut self, msg: ProtocolMessage) -> ZkResult<ProtocolMessage> {
        self.send_msg(&ProtocolResponse::ok(msg))?;
        self.wait_for_msg()
    }
}

fn main() -> Result<(), confy::ConfyError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::from_args();
    let cfg: ZKChannelConfig = confy::load("zkchannel_cfg")?;
    info!(version = cfg.version, db_url = %cfg.db_url, mpc_addr = %cfg.mpc_addr, "loaded config");

    println!("******************************************");
    print_error_result!(run(&cfg, args.command), "Command");
    println!("******************************************");
    Ok(())
}

fn run(cfg: &ZKChannelConfig, command: Command) -> ZkResult<()> {
    let db_url = cfg.db_url.clone();
    match command {
        Command::SETFEES(setfees) => {
            let tx_fee_info = mpc::TransactionFeeInfo {
                bal_min_cust: setfees.bal_min_cust,
                bal_min_merch: setfees.bal_min_merch,
                val_cpfp: setfees.val_cpfp,
                fee_cc: setfees.fee_cc,
                fee_mc: setfees.fee_mc,
                min_fee: setfees.min_fee,
                max_fee: setfees.max_fee,
            };
            println!("{}", tx_fee_info);
            store_tx_fee_info(&db_url, &tx_fee_info)?;
        }
        Command::MPC => {
            let listener = TcpListener::bind(&cfg.mpc_addr)?;
            serve_mpc(listener, Arc::new(LocalMpcCoordinator::new()))?;
        }
        Command::OPEN(open) => match open.party {
            Party::MERCH => merch::open(create_connection!(open), &db_url, open.self_delay)?,
            Party::CUST => cust::open(
                create_connection!(open),
                &db_url,
                open.cust_bal,
                open.merch_bal,
                open.channel_name,
            )?,
        },
        Command::INIT(init) => match init.party {
            Party::MERCH => merch::init(cfg, create_connection!(init), &db_url)?,
            Party::CUST => {
                let missing = |arg: &str| ZkChannelError::Validation(format!("missing --{}", arg));
                cust::init(
                    create_connection!(init),
                    &db_url,
                    init.txid.clone().ok_or_else(|| missing("txid"))?,
                    init.index.ok_or_else(|| missing("index"))?,
                    init.input_sats.ok_or_else(|| missing("input-sats"))?,
                    init.tx_fee,
                    init.channel_name,
                )?
            }
        },
        Command::ACTIVATE(activate) => {
            let (result, activate_time) = match activate.party {
                Party::MERCH => measure_one_arg!(merch::activate(cfg, create_connection!(activate), &db_url)),
                Party::CUST => measure_one_arg!(cust::activate(
                    create_connection!(activate),
                    &db_url,
                    activate.channel_name.clone(),
                )),
            };
            result?;
            if activate.benchmark {
                println!("BENCHMARK >> Activate: {} ms", activate_time);
            }
        }
        Command::UNLINK(unlink) => {
            let (result, unlink_time) = match unlink.party {
                Party::MERCH => measure_one_arg!(merch::pay(cfg, create_connection!(unlink), &db_url)),
                Party::CUST => measure_one_arg!(cust::pay(
                    cfg,
                    0,
                    None,
                    create_connection!(unlink),
                    &db_url,
                    unlink.channel_name.clone(),
                )),
            };
            result?;
            if unlink.benchmark {
                println!("BENCHMARK >> Unlink: {} ms", unlink_time);
            }
        }
        Command::PAY(pay) => match pay.party {
            Party::MERCH => loop {
                let (result, pay_time) = measure_one_arg!(merch::pay(cfg, create_connection!(pay), &db_url));
                print_error_result!(result, "Pay phase");
                if pay.benchmark {
                    println!("BENCHMARK >> Pay merchant: {} ms", pay_time);
                }
            },
            Party::CUST => {
                let amount = pay
                    .amount
                    .ok_or_else(|| ZkChannelError::Validation("missing --amount".to_string()))?;
                let (result, pay_time) = measure_one_arg!(cust::pay(
                    cfg,
                    amount,
                    pay.justification.clone(),
                    create_connection!(pay),
                    &db_url,
                    pay.channel_name.clone(),
                ));
                result?;
                if pay.benchmark {
                    println!("BENCHMARK >> Pay customer: {} ms", pay_time);
                }
            }
        },
        Command::CLOSE(close) => match close.party {
            Party::MERCH => merch::close(&db_url, close.file, close.channel_id)?,
            Party::CUST => cust::close(&db_url, close.file, close.from_merch_close, close.channel_id)?,
        },
    }
    Ok(())
}

mod cust {
    use super::*;
    use zkchannels_protocol::mpc::{ChannelMPCState, ChannelMPCToken, CustomerMPCState, FundingTxInfo};
    use zkchannels_protocol::transactions::btc::{sign_escrow_transaction, ChangeOutput, FundingInput, FundingInputType};
    use zkchannels_protocol::util::{compute_prevout, decode_hex_32, generate_keypair, reverse_bytes};
    use zkchannels_protocol::{FixedSizeArray16, FixedSizeArray32};

    const MPC_TIMEOUT: Duration = Duration::from_secs(60);

    struct CustomerRecord {
        channel_state: ChannelMPCState,
        channel_token: ChannelMPCToken,
        cust_state: CustomerMPCState,
    }

    fn load_state(db_conn: &mut redis::Connection, channel_name: &str) -> ZkResult<CustomerRecord> {
        let key = format!("id:{}", channel_name);
        let field = |name: &str| format!("cust:{}:{}", channel_name, name);
        Ok(CustomerRecord {
            channel_state: serde_json::from_str(&get_file_from_db(db_conn, &key, &field("channel_state"))?)?,
            channel_token: serde_json::from_str(&get_file_from_db(db_conn, &key, &field("channel_token"))?)?,
            cust_state: serde_json::from_str(&get_file_from_db(db_conn, &key, &field("cust_state"))?)?,
        })
    }

    fn save_state(db_conn: &mut redis::Connection, channel_name: &str, rec: &CustomerRecord) -> ZkResult<()> {
        let key = format!("id:{}", channel_name);
        let field = |name: &str| format!("cust:{}:{}", channel_name, name);
        store_file_in_db(db_conn, &key, &field("channel_state"), &serde_json::to_string(&rec.channel_state)?)?;
        store_file_in_db(db_conn, &key, &field("channel_token"), &serde_json::to_string(&rec.channel_token)?)?;
        store_file_in_db(db_conn, &key, &field("cust_state"), &serde_json::to_string(&rec.cust_state)?)?;
        Ok(())
    }

    pub fn open(conn: &mut Conn, db_url: &str, b0_cust: i64, b0_merch: i64, channel_name: String) -> ZkResult<()> {
        if channel_name.is_empty() {
            return Err(ZkChannelError::Validation("missing channel-name".to_string()));
        }
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let tx_fee_info = load_tx_fee_info(&mut db_conn)?;

        let (channel_state, pk_m) = conn.wait_for_msg()?.into_channel_offer()?;

        let (channel_token, cust_state) = mpc::init_customer(rng, &pk_m, b0_cust, b0_merch, &tx_fee_info, &channel_name)?;
        info!(channel = %channel_name, cust_bal = cust_state.cust_balance, merch_bal = cust_state.merch_balance, "customer state created");
        save_state(
            &mut db_conn,
            &channel_name,
            &CustomerRecord {
                channel_state,
                channel_token,
                cust_state,
            },
        )
    }

    pub fn init(
        conn: &mut Conn,
        db_url: &str,
        txid: String,
        index: u32,
        input_sats: i64,
        tx_fee: i64,
        channel_name: String,
    ) -> ZkResult<()> {
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let tx_fee_info = load_tx_fee_info(&mut db_conn)?;
        let mut rec = load_state(&mut db_conn, &channel_name)?;

        let cust_bal = rec.cust_state.cust_balance;
        let merch_bal = rec.cust_state.merch_balance;
        let cust_sk = secp256k1::SecretKey::from_slice(&rec.cust_state.get_secret_key())?;

        // generate a new change pk
        let (change_pk, change_sk) = generate_keypair(rng);
        println!("change pk: {}", hex::encode(&change_pk.serialize()[..]));

        // form and sign the escrow transaction; it is only broadcast once the
        // initial closing transactions are signed
        let funding = FundingInput {
            txid_le: reverse_bytes(&decode_hex_32("txid", &txid)?),
            index,
            input_sats,
            input_type: FundingInputType::P2wpkh,
            sk: cust_sk,
        };
        let escrow = sign_escrow_transaction(
            &funding,
            &rec.cust_state.pk_c,
            &rec.channel_token.pk_m,
            &ChangeOutput::PublicKey(change_pk),
            cust_bal,
            merch_bal,
            tx_fee,
        )?;

        let (cust_sig, merch_txid_be, merch_prevout) =
            mpc::customer_sign_merch_close_tx(&rec.channel_state, &rec.channel_token, &escrow.txid_le, &rec.cust_state)?;
        let msg = ProtocolMessage::MerchCloseSignature {
            escrow_txid_le: FixedSizeArray32(escrow.txid_le),
            init_state: rec.cust_state.get_initial_cust_state()?,
            fee_cc: rec.cust_state.get_fee_cc(),
            cust_sig: hex::encode(&cust_sig),
        };
        let (escrow_sig, merch_sig) = match conn.send_and_wait(msg)? {
            ProtocolMessage::InitCustCloseSignatures { escrow_sig, merch_sig } => {
                (hex::decode(escrow_sig)?, hex::decode(merch_sig)?)
            }
            other => return unexpected(other),
        };
        println!("Received signatures on cust-close-txs");

        let funding_tx = FundingTxInfo {
            init_cust_bal: cust_bal,
            init_merch_bal: merch_bal,
            escrow_txid: FixedSizeArray32(escrow.txid_be),
            escrow_prevout: FixedSizeArray32(compute_prevout(&escrow.txid_be, 0)),
            merch_txid: FixedSizeArray32(merch_txid_be),
            merch_prevout: FixedSizeArray32(merch_prevout),
            fee_mc: tx_fee_info.fee_mc,
            min_fee: tx_fee_info.min_fee,
            max_fee: tx_fee_info.max_fee,
        };
        rec.cust_state.set_funding_tx_info(&mut rec.channel_token, &funding_tx)?;

        let (init_cust_state, init_hash) = mpc::get_initial_state(&rec.cust_state)?;
        let msg = ProtocolMessage::InitialState {
            channel_token: rec.channel_token.clone(),
            init_state: init_cust_state,
            init_hash: FixedSizeArray32(init_hash),
        };
        match conn.send_and_wait(msg)? {
            ProtocolMessage::StatusUpdate { status, .. } => info!(%status, "merchant accepted the initial state"),
            other => return unexpected(other),
        }

        mpc::customer_verify_init_cust_close_txs(
            &rec.channel_state,
            &rec.channel_token,
            &escrow_sig,
            &merch_sig,
            &mut rec.cust_state,
        )?;
        // escrow is assumed to confirm once broadcast
        mpc::customer_mark_open_channel(&mut rec.cust_state)?;
        save_state(&mut db_conn, &channel_name, &rec)?;

        let signed_tx = escrow
            .signed_tx
            .ok_or_else(|| ZkChannelError::Validation("escrow transaction was not signed".to_string()))?;
        println!("Can now broadcast the signed escrow transaction");
        write_file("signed_escrow_tx.txt", hex::encode(&signed_tx))?;
        write_file("change_sk.txt", serde_json::to_string(&change_sk)?)?;
        Ok(())
    }

    pub fn activate(conn: &mut Conn, db_url: &str, channel_name: String) -> ZkResult<()> {
        let mut db_conn = connect_db(db_url)?;
        let mut rec = load_state(&mut db_conn, &channel_name)?;

        let s0 = mpc::activate_customer(&rec.cust_state)?;
        let msg = ProtocolMessage::ActivateRequest {
            channel_token: rec.channel_token.clone(),
            s0,
        };
        let pay_token = match conn.send_and_wait(msg)? {
            ProtocolMessage::PayToken0 { pay_token } => pay_token,
            other => return unexpected(other),
        };
        mpc::activate_customer_finalize(pay_token.0, &mut rec.cust_state)?;
        save_state(&mut db_conn, &channel_name, &rec)
    }

    pub fn pay(
        cfg: &ZKChannelConfig,
        amount: i64,
        justification: Option<String>,
        conn: &mut Conn,
        db_url: &str,
        channel_name: String,
    ) -> ZkResult<()> {
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let mut rec = load_state(&mut db_conn, &channel_name)?;

        let r = run_payment(cfg, rng, amount, justification, conn, &mut rec);
        match &r {
            Ok(()) => println!("Transaction succeeded!"),
            Err(_) => {
                println!("Transaction failed!");
                if rec.cust_state.payment_in_progress() {
                    mpc::pay_abort_customer(&mut rec.cust_state)?;
                }
                if !rec.cust_state.has_tokens() {
                    println!("No pay token for the current state; the channel can only be closed");
                }
            }
        }
        save_state(&mut db_conn, &channel_name, &rec)?;
        r
    }

    fn run_payment<R: rand::Rng>(
        cfg: &ZKChannelConfig,
        rng: &mut R,
        amount: i64,
        justification: Option<String>,
        conn: &mut Conn,
        rec: &mut CustomerRecord,
    ) -> ZkResult<()> {
        let (_, rev_state, rev_lock_com, session_id) =
            mpc::pay_prepare_customer(rng, &rec.channel_state, amount, &mut rec.cust_state)?;

        let msg = ProtocolMessage::PaymentRequest {
            session_id: FixedSizeArray16(session_id),
            nonce: FixedSizeArray16(rev_state.get_nonce()),
            rev_lock_com: FixedSizeArray32(rev_lock_com),
            amount,
            justification,
        };
        let pay_token_mask_com = match conn.send_and_wait(msg)? {
            ProtocolMessage::PayMaskCommitment { pay_token_mask_com } => pay_token_mask_com,
            other => return unexpected(other),
        };

        let coordinator = TcpMpcCoordinator::new(cfg.mpc_addr.clone());
        mpc::pay_update_customer(
            &rec.channel_state,
            &rec.channel_token,
            pay_token_mask_com.0,
            &coordinator,
            MPC_TIMEOUT,
            &mut rec.cust_state,
        )?;

        let masks = match conn.wait_for_msg()? {
            ProtocolMessage::MaskedTxInputs { masks, .. } => masks,
            other => return unexpected(other),
        };
        let revoked = mpc::pay_unmask_sigs_customer(&rec.channel_state, &rec.channel_token, &masks, &mut rec.cust_state)?;

        let msg = ProtocolMessage::Revocation {
            session_id: FixedSizeArray16(session_id),
            rev_state: revoked,
        };
        match conn.send_and_wait(msg)? {
            ProtocolMessage::PayTokenMask { pt_mask, pt_mask_r } => {
                mpc::pay_unmask_pay_token_customer(pt_mask.0, pt_mask_r.0, &mut rec.cust_state)
            }
            other => unexpected(other),
        }
    }

    pub fn close(db_url: &str, out_file: PathBuf, from_merch_close: bool, channel_name: String) -> ZkResult<()> {
        let mut db_conn = connect_db(db_url)?;
        let mut rec = load_state(&mut db_conn, &channel_name)?;

        let signed = mpc::force_customer_close(&rec.channel_state, &rec.channel_token, !from_merch_close, &mut rec.cust_state)?;
        save_state(&mut db_conn, &channel_name, &rec)?;
        println!("cust-close signed txid: {}", hex::encode(signed.txid_be));
        write_pathfile(out_file, signed.to_hex())
    }
}

mod merch {
    use super::*;
    use zkchannels_protocol::mpc::{ChannelMPCState, ChannelMPCToken, MerchantMPCState};
    use zkchannels_protocol::wire::WIRE_VERSION;
    use zkchannels_protocol::{FixedSizeArray16, MerchantService};

    static MERCH_STATE_KEY: &str = "merch_state";
    static CHANNEL_STATE_KEY: &str = "channel_state";
    static MERCH_DB_KEY: &str = "cli:merch_db";
    static MERCH_CHANNELS_KEY: &str = "cli:merch_channels";

    pub fn load_merchant_state_info(db_conn: &mut redis::Connection) -> ZkResult<(ChannelMPCState, MerchantMPCState)> {
        let channel_state = serde_json::from_str(&get_file_from_db(db_conn, MERCH_DB_KEY, CHANNEL_STATE_KEY)?)?;
        let merch_state = serde_json::from_str(&get_file_from_db(db_conn, MERCH_DB_KEY, MERCH_STATE_KEY)?)?;
        Ok((channel_state, merch_state))
    }

    fn merch_save_state_in_db(
        db_conn: &mut redis::Connection,
        channel_state: Option<&ChannelMPCState>,
        merch_state: &MerchantMPCState,
    ) -> ZkResult<()> {
        if let Some(n) = channel_state {
            store_file_in_db(db_conn, MERCH_DB_KEY, CHANNEL_STATE_KEY, &serde_json::to_string(n)?)?;
        }
        store_file_in_db(db_conn, MERCH_DB_KEY, MERCH_STATE_KEY, &serde_json::to_string(merch_state)?)?;
        Ok(())
    }

    fn save_channel_token(db_conn: &mut redis::Connection, channel_token: &ChannelMPCToken) -> ZkResult<()> {
        let channel_id_str = hex::encode(channel_token.compute_channel_id()?);
        store_file_in_db(
            db_conn,
            MERCH_CHANNELS_KEY,
            &format!("id:{}", channel_id_str),
            &serde_json::to_string(channel_token)?,
        )?;
        Ok(())
    }

    fn load_service(cfg: &ZKChannelConfig, db_conn: &mut redis::Connection) -> ZkResult<MerchantService<RedisDatabase>> {
        let (channel_state, merch_state) = load_merchant_state_info(db_conn)?;
        let db = get_merch_db_connection(cfg.db_url.clone())?;
        let coordinator = Arc::new(TcpMpcCoordinator::new(cfg.mpc_addr.clone()));
        Ok(MerchantService::new(merch_state, channel_state, db, coordinator))
    }

    /// Handles one request and sends the reply (or the error) back.
    fn serve_one<R: rand::Rng>(
        conn: &mut Conn,
        rng: &mut R,
        service: &MerchantService<RedisDatabase>,
    ) -> ZkResult<ProtocolMessage> {
        let msg = conn.wait_for_msg()?;
        let r = service.handle_message(rng, msg.clone()).and_then(|reply| {
            reply.ok_or_else(|| ZkChannelError::Validation("request needs no reply".to_string()))
        });
        conn.reply(r)?;
        Ok(msg)
    }

    pub fn open(conn: &mut Conn, db_url: &str, self_delay: u16) -> ZkResult<()> {
        let mut db_conn = connect_db(db_url)?;
        let (channel_state, merch_state) = match load_merchant_state_info(&mut db_conn) {
            Ok(n) => n,
            Err(ZkChannelError::NotFound(_)) => {
                // create a new channel state and merchant state DB
                let rng = &mut rand::thread_rng();
                let tx_fee_info = load_tx_fee_info(&mut db_conn)?;
                if tx_fee_info.bal_min_cust == 0 || tx_fee_info.bal_min_merch == 0 {
                    return Err(ZkChannelError::Validation("Dust limit must be greater than 0!".to_string()));
                }
                let mut channel_state = ChannelMPCState::new(
                    String::from("Channel"),
                    self_delay,
                    tx_fee_info.bal_min_cust,
                    tx_fee_info.bal_min_merch,
                    tx_fee_info.val_cpfp,
                    false,
                );
                let merch_state = mpc::init_merchant(rng, db_url.to_string(), &mut channel_state, "Merchant");
                merch_save_state_in_db(&mut db_conn, Some(&channel_state), &merch_state)?;
                (channel_state, merch_state)
            }
            Err(e) => return Err(e),
        };

        // send initial channel info
        conn.send_msg(&ProtocolResponse::ok(ProtocolMessage::ChannelOffer {
            version: WIRE_VERSION,
            channel_state,
            pk_m: merch_state.pk_m,
        }))
    }

    pub fn init(cfg: &ZKChannelConfig, conn: &mut Conn, db_url: &str) -> ZkResult<()> {
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let service = load_service(cfg, &mut db_conn)?;

        // merch-close signature, then the initial state
        serve_one(conn, rng, &service)?;
        merch_save_state_in_db(&mut db_conn, None, &service.merch_state())?;
        match serve_one(conn, rng, &service)? {
            ProtocolMessage::InitialState { channel_token, .. } => {
                // escrow is assumed to confirm once broadcast
                service.mark_open(channel_token.escrow_txid.0)?;
                save_channel_token(&mut db_conn, &channel_token)
            }
            other => unexpected(other),
        }
    }

    pub fn activate(cfg: &ZKChannelConfig, conn: &mut Conn, db_url: &str) -> ZkResult<()> {
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let service = load_service(cfg, &mut db_conn)?;
        match serve_one(conn, rng, &service)? {
            ProtocolMessage::ActivateRequest { .. } => Ok(()),
            other => unexpected(other),
        }
    }

    pub fn pay(cfg: &ZKChannelConfig, conn: &mut Conn, db_url: &str) -> ZkResult<()> {
        let rng = &mut rand::thread_rng();
        let mut db_conn = connect_db(db_url)?;
        let service = load_service(cfg, &mut db_conn)?;

        let session_id = match serve_one(conn, rng, &service)? {
            ProtocolMessage::PaymentRequest {
                session_id,
                amount,
                justification,
                ..
            } => {
                info!(amount, justification = ?justification, "payment request");
                session_id
            }
            other => return unexpected(other),
        };

        let masks = service.pay_update(rng, session_id.0);
        conn.reply(masks.map(|masks| ProtocolMessage::MaskedTxInputs {
            session_id: FixedSizeArray16(session_id.0),
            masks,
        }))?;

        match serve_one(conn, rng, &service)? {
            ProtocolMessage::Revocation { .. } => Ok(()),
            other => unexpected(other),
        }
    }

    pub fn list_channels(db_conn: &mut redis::Connection) -> ZkResult<()> {
        let channel_ids: Vec<String> = db_conn.hkeys(MERCH_CHANNELS_KEY)?;
        println!("List zkchannels...");
        for id in channel_ids {
            println!("{}", id);
        }
        Ok(())
    }

    pub fn close(db_url: &str, out_file: PathBuf, channel_id: String) -> ZkResult<()> {
        // output the merch-close-tx (only thing merchant can broadcast to close channel)
        let mut db_conn = connect_db(db_url)?;
        if channel_id.is_empty() {
            return list_channels(&mut db_conn);
        }

        let (_, merch_state) = load_merchant_state_info(&mut db_conn)?;
        let ser_channel_token = get_file_from_db(&mut db_conn, MERCH_CHANNELS_KEY, &format!("id:{}", channel_id))?;
        let channel_token: ChannelMPCToken = serde_json::from_str(&ser_channel_token)?;

        let mut db = get_merch_db_connection(db_url.to_string())?;
        let signed = mpc::force_merchant_close(&mut db, &channel_token.escrow_txid.0, &merch_state)?;
        write_pathfile(out_file, signed.to_hex())?;
        println!("merch-close-tx signed txid: {}", hex::encode(signed.txid_be));
        Ok(())
    }
}
