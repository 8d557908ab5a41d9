//! rafcoin command-line front-end.
//!
//! Usage:
//!   rafcoin createwallet
//!   rafcoin createblockchain --address ADDR
//!   rafcoin getbalance --address ADDR
//!   rafcoin listaddresses
//!   rafcoin printchain
//!   rafcoin reindexutxo
//!   rafcoin send --from ADDR --to ADDR --amount N
//!   rafcoin startnode --port P [--seed IP:PORT] [--rpcport P] [--mine --mineraddress ADDR]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use rafcoin::chain::Blockchain;
use rafcoin::config;
use rafcoin::constants;
use rafcoin::crypto;
use rafcoin::node::{Node, NodeConfig};
use rafcoin::pow::{no_abort, ProofOfWork};
use rafcoin::transaction::Transaction;
use rafcoin::utxo::UtxoSet;
use rafcoin::wallet::WalletStore;

/// A proof-of-work UTXO cryptocurrency node.
#[derive(Parser)]
#[command(name = "rafcoin", version, about = "A proof-of-work UTXO cryptocurrency node")]
struct Cli {
    /// Data directory for the block store and wallet file.
    #[arg(long, default_value = constants::DEFAULT_DATA_DIR, global = true)]
    datadir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new wallet and print its address.
    Createwallet,

    /// Create a blockchain and pay the genesis reward to an address.
    Createblockchain {
        #[arg(long)]
        address: String,
    },

    /// Show the balance of an address.
    Getbalance {
        #[arg(long)]
        address: String,
    },

    /// List all addresses in the wallet file.
    Listaddresses,

    /// Print every block of the chain, tip first.
    Printchain,

    /// Rebuild the UTXO index from the chain.
    Reindexutxo,

    /// Send coins, mining the transfer into a new block.
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: i64,
    },

    /// Run a full node.
    Startnode {
        /// P2P listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Seed node to connect to, as IP:PORT.
        #[arg(long)]
        seed: Option<String>,

        /// JSON-RPC listen port (localhost only).
        #[arg(long)]
        rpcport: Option<u16>,

        /// Enable background mining.
        #[arg(long)]
        mine: bool,

        /// Address collecting mining rewards.
        #[arg(long)]
        mineraddress: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Createwallet => {
            let mut store = WalletStore::load(&config::wallet_path(&cli.datadir))?;
            let address = store.create_wallet();
            store.save()?;
            println!("Your new address: {}", address);
        }

        Command::Createblockchain { address } => {
            require_valid_address(&address)?;
            let chain = Blockchain::create(&config::blocks_path(&cli.datadir), &address)?;
            UtxoSet::new(&chain).reindex()?;
            println!("Done!");
        }

        Command::Getbalance { address } => {
            require_valid_address(&address)?;
            let chain = Blockchain::open(&config::blocks_path(&cli.datadir))?;
            let pub_key_hash = crypto::address_to_pubkey_hash(&address)?;
            let balance: i64 = UtxoSet::new(&chain)
                .find_utxo(&pub_key_hash)?
                .iter()
                .map(|out| out.value)
                .sum();
            println!("Balance of '{}': {}", address, balance);
        }

        Command::Listaddresses => {
            let store = WalletStore::load(&config::wallet_path(&cli.datadir))?;
            let addresses = store.addresses();
            if addresses.is_empty() {
                println!("No wallets found. Create one with 'createwallet'.");
            } else {
                println!("Addresses:");
                for address in addresses {
                    println!("  {}", address);
                }
            }
        }

        Command::Printchain => print_chain(&cli.datadir)?,

        Command::Reindexutxo => {
            let chain = Blockchain::open(&config::blocks_path(&cli.datadir))?;
            let utxo = UtxoSet::new(&chain);
            utxo.reindex()?;
            println!(
                "Done! The UTXO index now tracks {} transaction(s).",
                utxo.count_transactions()?
            );
        }

        Command::Send { from, to, amount } => send(&cli.datadir, &from, &to, amount)?,

        Command::Startnode {
            port,
            seed,
            rpcport,
            mine,
            mineraddress,
        } => start_node(cli.datadir, port, seed, rpcport, mine, mineraddress).await?,
    }
    Ok(())
}

fn require_valid_address(address: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !crypto::validate_address(address) {
        return Err(format!("invalid address '{}'", address).into());
    }
    Ok(())
}

/// Build, sign, and mine a transfer into a fresh block; the block's coinbase
/// rewards the sender.
fn send(
    data_dir: &Path,
    from: &str,
    to: &str,
    amount: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    require_valid_address(from)?;
    require_valid_address(to)?;
    if amount <= 0 {
        return Err("amount must be positive".into());
    }

    let store = WalletStore::load(&config::wallet_path(data_dir))?;
    let wallet = store.get(from)?;

    let mut chain = Blockchain::open(&config::blocks_path(data_dir))?;
    let mut tx = UtxoSet::new(&chain).new_transaction(wallet.public_key(), to, amount)?;
    chain.sign_transaction(&mut tx, wallet)?;

    let next_height = chain.height() + 1;
    let coinbase = Transaction::new_coinbase(from, "", next_height)?;
    let block = chain.mine_block(vec![coinbase, tx], no_abort())?;
    UtxoSet::new(&chain).update(&block)?;

    println!("Success!");
    Ok(())
}

fn print_chain(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let chain = Blockchain::open(&config::blocks_path(data_dir))?;

    for block in chain.iter() {
        let block = block?;
        println!("Block {}", hex::encode(block.hash));
        println!("Prev. block: {}", hex::encode(block.prev_hash));
        let pow_ok = ProofOfWork::new(&block).map(|p| p.validate()).unwrap_or(false);
        println!("PoW: {}", pow_ok);
        println!();

        for tx in &block.transactions {
            println!("--- Transaction {}:", tx.id_hex());
            if tx.is_coinbase() {
                println!("\tCOINBASE");
            } else {
                println!("\tInputs:");
                for input in &tx.vin {
                    println!("\t\tTxID: {}", hex::encode(&input.txid));
                    println!("\t\tVout: {}", input.vout);
                }
            }
            println!("\tOutputs:");
            for (i, output) in tx.vout.iter().enumerate() {
                println!("\t\tOutput {}:", i);
                println!("\t\t\tValue: {}", output.value);
                println!("\t\t\tPubKeyHash: {}", hex::encode(&output.pub_key_hash));
            }
            println!();
        }
        println!();
    }
    Ok(())
}

async fn start_node(
    data_dir: PathBuf,
    port: Option<u16>,
    seed: Option<String>,
    rpc_port: Option<u16>,
    mine: bool,
    miner_address: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = config::FileConfig::load(&data_dir);

    let miner_address = if mine {
        let address = miner_address
            .or(file.node.miner_address.clone())
            .ok_or("--mineraddress is required with --mine")?;
        require_valid_address(&address)?;
        Some(address)
    } else {
        None
    };

    let node_config = NodeConfig {
        listen_ip: file.node.listen_ip,
        port: port.unwrap_or(file.node.port),
        rpc_port: rpc_port.unwrap_or(file.node.rpc_port),
        seed: seed.or(file.node.seed),
        miner_address,
        data_dir,
    };

    let node = Node::new(node_config)?;
    let stopper = node.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Interrupt received, shutting down...");
        stopper.stop();
    });

    node.run().await?;
    Ok(())
}
