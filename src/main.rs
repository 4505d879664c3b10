//! Command-line front end for the content-extraction engine.
//!
//! One subcommand per Package Builder operation (`dump-xci`, `dump-nsp`,
//! `extract-exefs-tree`, `extract-romfs-tree`, `extract-ticket`), each
//! subcommand's flags mirroring the configuration records of the library's
//! function-call API. The core has no knowledge of files or terminals; this
//! binary supplies both, via a [`FileSplitStrategy`] and a `tracing`
//! subscriber feeding [`TracingObserver`].
//!
//! Exit codes: 0 success, 1 user-cancelled, 2 input/media error, 3 key/
//! ticket missing, 4 integrity failure, 5 configuration error.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Cursor};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;

use nx_archive::builder::nsp::{NspOptions, NspProducer, RawContent};
use nx_archive::builder::sequential::XciSidecar;
use nx_archive::builder::tree::{ExeFsTreeProducer, RomFsTreeProducer, TreeOptions};
use nx_archive::builder::xci::{XciOptions, XciProducer};
use nx_archive::cancel::CancellationToken;
use nx_archive::formats::cnmt::{Cnmt, PackagedContentType};
use nx_archive::formats::keys::TitleKeys;
use nx_archive::formats::keyset::Keyset;
use nx_archive::formats::nca::Nca;
use nx_archive::formats::ticket::Ticket;
use nx_archive::formats::xci::XciHeader;
use nx_archive::formats::RightsId;
use nx_archive::progress::TracingObserver;
use nx_archive::streamer::{Checkpoint, SplitMode, SplitStrategy, Streamer, WriteSeek};
use nx_archive::Error;

#[derive(Parser)]
#[command(author, version, about = "Nintendo Switch content extraction engine", long_about = None)]
struct Cli {
    /// Path to a `prod.keys`-style key file.
    #[arg(long, global = true)]
    keyset: PathBuf,

    /// Path to a `title.keys`-style rights-id -> title-key file.
    #[arg(long, global = true)]
    title_keys: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a gamecard image out, optionally trimmed and cert-masked.
    DumpXci {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        fat_split: bool,
        #[arg(long)]
        keep_cert: bool,
        #[arg(long)]
        trim: bool,
        #[arg(long)]
        calc_crc: bool,
        /// Persist a `<output>.seq` sidecar after every chunk, and resume
        /// from it on a subsequent run that finds one already on disk.
        #[arg(long)]
        resumable: bool,
    },
    /// Repack a title's CNMT + content NCAs into a standalone NSP.
    DumpNsp {
        /// Directory holding `<contentid>.nca` and the `<contentid>.cnmt.nca`
        /// meta content, named per the usual on-console convention.
        title_dir: PathBuf,
        output: PathBuf,
        #[arg(long)]
        fat_split: bool,
        /// Omit the ticket/cert and depersonalize rights-id content instead.
        #[arg(long)]
        tikless: bool,
        #[arg(long)]
        include_delta_fragments: bool,
        /// Scrub the bundled ticket's device/account/ticket identifiers and
        /// rewrite it to a common ticket. No-op when `tikless` is set.
        #[arg(long)]
        remove_console_data: bool,
        /// Console eticket RSA private key (PEM), needed to decrypt a
        /// personalized ticket's title key for `remove_console_data`.
        #[arg(long)]
        eticket_rsa_key: Option<PathBuf>,
        /// Tool RSA private key (PEM) whose public half replaces the Program
        /// NCA's ACID public key, re-signing `main.npdm` to match.
        #[arg(long)]
        acid_patch_key: Option<PathBuf>,
    },
    /// Extract every file of an NCA's ExeFS (PFS0) section to a directory.
    ExtractExefsTree {
        nca: PathBuf,
        #[arg(long, default_value_t = 0)]
        section_index: usize,
        output_dir: PathBuf,
        #[arg(long)]
        fat_split: bool,
    },
    /// Extract every file of an NCA's RomFS section to a directory.
    ExtractRomfsTree {
        nca: PathBuf,
        #[arg(long, default_value_t = 0)]
        section_index: usize,
        output_dir: PathBuf,
        #[arg(long)]
        fat_split: bool,
    },
    /// Pull a ticket/cert pair for a rights-id out of a PFS0/NSP into files.
    ExtractTicket {
        nsp: PathBuf,
        rights_id: String,
        output_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &Error) -> u8 {
    match e {
        Error::Cancelled => 1,
        Error::Io(_) | Error::ShortRead { .. } | Error::Backend(_) | Error::MediaRemoved => 2,
        Error::KeyMissing(_) | Error::TicketNotFound(_) | Error::TitleKeyError(_) => 3,
        Error::IntegrityMismatch(_) | Error::BadMagic | Error::UnsupportedVersion(_) | Error::BadSectionTable(_) => 4,
        Error::InvalidArgument(_) | Error::InvalidFormat(_) => 5,
        _ => 2,
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let keyset = Keyset::from_file(&cli.keyset)?;
    let title_keys = cli
        .title_keys
        .as_ref()
        .map(TitleKeys::load_from_file)
        .transpose()?;
    let cancel = CancellationToken::new();
    let observer = TracingObserver;

    match cli.command {
        Command::DumpXci { input, output, fat_split, keep_cert, trim, calc_crc, resumable } => {
            dump_xci(&input, &output, fat_split, keep_cert, trim, calc_crc, resumable, &cancel)
        }
        Command::DumpNsp {
            title_dir,
            output,
            fat_split,
            tikless,
            include_delta_fragments,
            remove_console_data,
            eticket_rsa_key,
            acid_patch_key,
        } => dump_nsp(
            &title_dir,
            &output,
            &keyset,
            title_keys.as_ref(),
            fat_split,
            tikless,
            include_delta_fragments,
            remove_console_data,
            eticket_rsa_key.as_deref(),
            acid_patch_key.as_deref(),
            &cancel,
        ),
        Command::ExtractExefsTree { nca, section_index, output_dir, fat_split } => {
            extract_exefs_tree(&nca, section_index, &output_dir, fat_split, &keyset, title_keys.as_ref(), &cancel)
        }
        Command::ExtractRomfsTree { nca, section_index, output_dir, fat_split } => {
            extract_romfs_tree(&nca, section_index, &output_dir, fat_split, &keyset, title_keys.as_ref(), &observer, &cancel)
        }
        Command::ExtractTicket { nsp, rights_id, output_dir } => extract_ticket(&nsp, &rights_id, &output_dir),
    }
}

fn dump_xci(
    input: &std::path::Path,
    output: &std::path::Path,
    fat_split: bool,
    keep_cert: bool,
    trim: bool,
    calc_crc: bool,
    resumable: bool,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut header_reader = BufReader::new(File::open(input)?);
    let header = XciHeader::from_reader(&mut header_reader)?;

    let options = XciOptions { trim, keep_certificate: keep_cert, calc_crc };
    let split_mode = if fat_split { SplitMode::FatSplit } else { SplitMode::Single };

    let sidecar_path = xci_sidecar_path(output);
    let (mut streamer, resume_from) = if resumable && sidecar_path.exists() {
        let sidecar = XciSidecar::load(&sidecar_path)?;
        if sidecar.keep_certificate != keep_cert || sidecar.trim != trim || sidecar.calc_crc != calc_crc {
            return Err(Error::InvalidArgument(
                "resume sidecar's options don't match the current dump-xci flags".to_string(),
            ));
        }
        let strategy = FileSplitStrategy::resuming(output.to_path_buf());
        let checkpoint = Checkpoint { logical_position: sidecar.partition_offset, ..Default::default() };
        (Streamer::resume(strategy, split_mode, checkpoint), sidecar.partition_offset)
    } else {
        let strategy = FileSplitStrategy::new(output.to_path_buf());
        (Streamer::open(strategy, split_mode), 0)
    };

    let source = File::open(input)?;
    let mut save_sidecar = |position: u64| -> Result<(), Error> {
        XciSidecar {
            keep_certificate: keep_cert,
            trim,
            calc_crc,
            chunk_index: 0,
            partition_index: 0,
            partition_offset: position,
            cert_crc32: 0,
            certless_crc32: 0,
        }
        .save(&sidecar_path)
    };
    let callback: Option<&mut dyn FnMut(u64) -> Result<(), Error>> =
        if resumable { Some(&mut save_sidecar) } else { None };

    let result = XciProducer::build(&header, source, &options, &mut streamer, cancel, resume_from, callback)?;
    if resumable {
        XciSidecar::delete(&sidecar_path)?;
    }
    if let Some(crc) = result.with_certificate {
        tracing::info!(crc32 = format!("{crc:08X}"), "certificate-kept CRC32");
    }
    if let Some(crc) = result.certless {
        tracing::info!(crc32 = format!("{crc:08X}"), "certless CRC32");
    }
    Ok(())
}

/// `<output>.seq`, per `builder::sequential`'s sidecar naming convention.
fn xci_sidecar_path(output: &std::path::Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".seq");
    PathBuf::from(name)
}

fn dump_nsp(
    title_dir: &std::path::Path,
    output: &std::path::Path,
    keyset: &Keyset,
    title_keys: Option<&TitleKeys>,
    fat_split: bool,
    tikless: bool,
    include_delta_fragments: bool,
    remove_console_data: bool,
    eticket_rsa_key: Option<&std::path::Path>,
    acid_patch_key: Option<&std::path::Path>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let meta_path = fs::read_dir(title_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.to_string_lossy().ends_with(".cnmt.nca"))
        .ok_or_else(|| Error::NotFound(format!("no .cnmt.nca in {}", title_dir.display())))?;

    let meta_bytes = fs::read(&meta_path)?;
    let mut meta_nca = Nca::from_reader(Cursor::new(meta_bytes.clone()), keyset, title_keys)?;
    let mut pfs0 = meta_nca.open_pfs0_filesystem(0)?;
    let cnmt_name = pfs0
        .list_files()?
        .into_iter()
        .find(|n| n.ends_with(".cnmt"))
        .ok_or_else(|| Error::NotFound("meta NCA has no .cnmt entry".to_string()))?;
    let cnmt_bytes = pfs0.read_file(&cnmt_name)?;
    let cnmt = Cnmt::from_reader(&mut Cursor::new(cnmt_bytes))?;

    let mut contents = Vec::new();
    let mut ticket_and_cert = None;
    for entry in &cnmt.content_entries {
        if entry.info.content_type == PackagedContentType::Meta {
            continue;
        }
        let hex = hex::encode(entry.info.content_id);
        let path = title_dir.join(format!("{hex}.nca"));
        let bytes = fs::read(&path).map_err(|_| Error::NotFound(format!("missing content {hex}.nca")))?;
        contents.push(RawContent {
            content_type: entry.info.content_type,
            content_id: nx_archive::formats::ContentId(entry.info.content_id),
            bytes,
        });
    }

    if !tikless {
        if let Some((tik_path, cert_path)) = find_ticket_pair(title_dir)? {
            let tik = fs::read(&tik_path)?;
            let cert = fs::read(&cert_path)?;
            let ticket = Ticket::from_bytes(&tik)?;
            ticket_and_cert = Some((tik, cert, ticket.rights_id()));
        }
    }

    let eticket_key = eticket_rsa_key.map(load_rsa_private_key).transpose()?;
    let acid_patch_key = acid_patch_key.map(load_rsa_private_key).transpose()?;

    let mut producer = NspProducer::new(keyset, title_keys);
    if let Some(key) = eticket_key.as_ref() {
        producer = producer.with_eticket_rsa_key(key);
    }
    let options = NspOptions {
        include_ticket_and_cert: ticket_and_cert.is_some(),
        include_delta_fragments,
        remove_console_data,
        acid_patch_key,
    };
    let split_mode = if fat_split { SplitMode::FatSplit } else { SplitMode::Single };
    let strategy = FileSplitStrategy::new(output.to_path_buf());
    let mut streamer = Streamer::open(strategy, split_mode);

    producer.build(meta_bytes, cnmt, contents, ticket_and_cert, &options, &mut streamer, cancel)
}

/// Loads an RSA private key from a PEM file, trying PKCS#1 then PKCS#8.
fn load_rsa_private_key(path: &std::path::Path) -> Result<RsaPrivateKey, Error> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|e| Error::InvalidData(format!("bad RSA private key {}: {e}", path.display())))
}

fn find_ticket_pair(dir: &std::path::Path) -> Result<Option<(PathBuf, PathBuf)>, Error> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tik") {
            let cert_path = path.with_extension("cert");
            if cert_path.exists() {
                return Ok(Some((path, cert_path)));
            }
        }
    }
    Ok(None)
}

fn extract_exefs_tree(
    nca_path: &std::path::Path,
    section_index: usize,
    output_dir: &std::path::Path,
    fat_split: bool,
    keyset: &Keyset,
    title_keys: Option<&TitleKeys>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    fs::create_dir_all(output_dir)?;
    let bytes = fs::read(nca_path)?;
    let mut nca = Nca::from_reader(Cursor::new(bytes), keyset, title_keys)?;
    let mut pfs0 = nca.open_pfs0_filesystem(section_index)?;
    let options = TreeOptions { fat_split };

    ExeFsTreeProducer::extract(
        &mut pfs0,
        &options,
        |name| Ok(FileSplitStrategy::new(output_dir.join(name))),
        cancel,
    )?;
    Ok(())
}

fn extract_romfs_tree(
    nca_path: &std::path::Path,
    section_index: usize,
    output_dir: &std::path::Path,
    fat_split: bool,
    keyset: &Keyset,
    title_keys: Option<&TitleKeys>,
    observer: &dyn nx_archive::progress::ProgressObserver,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    fs::create_dir_all(output_dir)?;
    let bytes = fs::read(nca_path)?;
    let mut nca = Nca::from_reader(Cursor::new(bytes), keyset, title_keys)?;
    let mut romfs = nca.open_romfs_filesystem(section_index)?;
    let options = TreeOptions { fat_split };

    RomFsTreeProducer::extract(
        &mut romfs,
        &options,
        |path| {
            let relative = path.trim_start_matches('/');
            let dest = output_dir.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(FileSplitStrategy::new(dest))
        },
        observer,
        cancel,
    )?;
    Ok(())
}

fn extract_ticket(nsp_path: &std::path::Path, rights_id: &str, output_dir: &std::path::Path) -> Result<(), Error> {
    fs::create_dir_all(output_dir)?;
    let rights_id = RightsId(
        hex::decode(rights_id)
            .map_err(|e| Error::InvalidArgument(format!("rights-id must be hex: {e}")))?
            .try_into()
            .map_err(|_| Error::InvalidArgument("rights-id must be 16 bytes".to_string()))?,
    );

    let mut pfs0 = nx_archive::formats::pfs0::Pfs0::from_reader(BufReader::new(File::open(nsp_path)?))?;
    let hex = rights_id.to_hex_upper();
    let tik = pfs0.read_file(&format!("{hex}.tik"))?;
    let cert = pfs0.read_file(&format!("{hex}.cert")).unwrap_or_default();

    fs::write(output_dir.join(format!("{hex}.tik")), tik)?;
    if !cert.is_empty() {
        fs::write(output_dir.join(format!("{hex}.cert")), cert)?;
    }
    Ok(())
}

/// A [`SplitStrategy`] over real files: chunk 0 writes to `base_path`
/// itself, later chunks to `<base_path>.NN`, mirroring the gamecard
/// dumper's own zero-padded two-digit FAT32-split suffixes.
struct FileSplitStrategy {
    base_path: PathBuf,
    opened: Vec<PathBuf>,
    truncate: bool,
}

impl FileSplitStrategy {
    fn new(base_path: PathBuf) -> Self {
        Self { base_path, opened: Vec::new(), truncate: true }
    }

    /// Like [`Self::new`], but opens chunk files without truncating — for
    /// resuming a dump whose earlier chunks already hold real data.
    fn resuming(base_path: PathBuf) -> Self {
        Self { base_path, opened: Vec::new(), truncate: false }
    }

    fn chunk_path(&self, index: u64) -> PathBuf {
        if index == 0 {
            self.base_path.clone()
        } else {
            let mut name = self.base_path.clone().into_os_string();
            name.push(format!(".{index:02}"));
            PathBuf::from(name)
        }
    }
}

impl SplitStrategy for FileSplitStrategy {
    fn open_chunk(&mut self, index: u64) -> Result<Box<dyn WriteSeek>, Error> {
        let path = self.chunk_path(index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).truncate(self.truncate).open(&path)?;
        self.opened.push(path);
        Ok(Box::new(file))
    }

    fn delete_all(&mut self) -> Result<(), Error> {
        for path in self.opened.drain(..) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }
}
