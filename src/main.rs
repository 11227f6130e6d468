//! Interactive REPL front-end for the kiloader analysis library.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;

use kiloader::analyzer::{parse_address_or_name, Analyzer, DEFAULT_DISASM_COUNT};
use kiloader::format::ExportFormat;

#[derive(Parser)]
#[command(name = "kiloader", about = "Nintendo Switch NSO analyzer", version)]
struct Cli {
    /// NSO file to load on startup
    nso: Option<PathBuf>,

    /// Run the full analysis immediately after loading
    #[arg(short, long)]
    analyze: bool,

    /// Override the snapshot base directory
    #[arg(long)]
    progress_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_module("kiloader", level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    println!("KILOADER - Nintendo Switch NSO Analyzer");
    println!("========================================\n");

    let mut analyzer = Analyzer::new();
    if let Some(dir) = cli.progress_dir {
        analyzer.set_progress_dir(dir);
    }

    if let Some(path) = &cli.nso {
        cmd_load(&mut analyzer, &path.display().to_string());
        if cli.analyze && analyzer.is_loaded() {
            cmd_analyze(&mut analyzer);
        }
    }

    println!("\nType 'help' for commands.\n");

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            continue;
        };
        let cmd = cmd.to_lowercase();
        let args = &tokens[1..];

        match cmd.as_str() {
            "quit" | "exit" | "q" => break,
            "help" | "h" | "?" => print_help(),
            "load" => match args.first() {
                Some(path) => cmd_load(&mut analyzer, path),
                None => println!("Usage: load <path>"),
            },
            "analyze" => cmd_analyze(&mut analyzer),
            "info" => cmd_info(&analyzer),
            "disasm" | "d" => cmd_disasm(&analyzer, args),
            "func" | "f" => cmd_func(&analyzer, args),
            "pseudo" | "p" => cmd_pseudo(&analyzer, args),
            "xref" | "x" => cmd_xref(&analyzer, args),
            "xrefto" => cmd_xref_dir(&analyzer, args, true),
            "xreffrom" => cmd_xref_dir(&analyzer, args, false),
            "strings" | "s" => cmd_strings(&analyzer, args),
            "findstr" => cmd_findstr(&analyzer, args),
            "list" | "l" => cmd_list(&analyzer, args),
            "export" => cmd_export(&analyzer, args),
            "expfunc" => cmd_expfunc(&analyzer, args),
            "expstr" => cmd_expstr(&analyzer, args),
            "save" => cmd_save(&analyzer),
            "progress" => cmd_progress(&mut analyzer, args),
            _ => println!("Unknown command: {}. Type 'help' for commands.", cmd),
        }
    }

    println!("Goodbye!");
}

fn print_help() {
    println!(
        r#"
Commands:
  load <path>           Load an NSO file
  analyze               Run full analysis (functions, strings, xrefs)

  disasm <addr> [n]     Disassemble n instructions at address
  func <addr|name>      Show function at address or by name (e.g. FUN_7104e53010)
  pseudo <addr|name>    Show pseudocode for function

  xref <addr>           Show cross-references to/from address
  xrefto <addr>         Show references TO address
  xreffrom <addr>       Show references FROM address

  strings <pattern>     Search for strings containing pattern
  findstr <string>      Find exact string address

  list funcs [n]        List functions (optionally first n)
  list funccount        Show function count
  list strcount         Show string count
  list strings [n]      List strings (optionally first n)

  export <path> [fmt]   Export full analysis (fmt: text, csv, json)
  expfunc <path>        Export function list
  expstr <path>         Export string list

  save                  Save analysis snapshot for this build ID
  progress list         List saved snapshots
  progress load <id>    Restore a snapshot by build ID
  progress delete <id>  Delete a snapshot

  info                  Show loaded NSO info
  help                  Show this help
  quit                  Exit

Addresses can be in hex (0x...) or decimal.
Function names can be like: FUN_7104e53010 or sub_7104e53010
"#
    );
}

fn parse_arg(arg: &str) -> Option<u64> {
    match parse_address_or_name(arg) {
        Ok(addr) => Some(addr),
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

fn cmd_load(analyzer: &mut Analyzer, path: &str) {
    match analyzer.load_nso(path) {
        Ok(()) => {
            let image = analyzer.image().unwrap();
            println!("Loaded NSO: {}", path);
            println!("  Build ID: {}", image.build_id());
            println!("  Text size: 0x{:x}", image.text().size());
            println!("  Rodata size: 0x{:x}", image.rodata().size());
            println!("  Data size: 0x{:x}", image.data().size());
        }
        Err(e) => println!("Failed to load NSO: {}", e),
    }
}

fn cmd_analyze(analyzer: &mut Analyzer) {
    match analyzer.analyze() {
        Ok(()) => {
            println!("Analysis complete:");
            println!("  Functions: {}", analyzer.function_count());
            println!("  Strings: {}", analyzer.string_count());
            println!("  XRefs: {}", analyzer.xref_count());
        }
        Err(e) => println!("Analysis failed: {}", e),
    }
}

fn cmd_info(analyzer: &Analyzer) {
    match analyzer.image() {
        Some(image) => {
            println!("Build ID: {}", image.build_id());
            println!("Base: 0x{:x}", image.base_address());
            for seg in [image.text(), image.rodata(), image.data()] {
                println!(
                    "{}: offset 0x{:x}, 0x{:x} bytes [{}]",
                    seg.kind,
                    seg.mem_offset,
                    seg.size(),
                    seg.kind.permissions()
                );
            }
            let header = image.header();
            println!("Bss: 0x{:x} bytes", header.bss_size);
            for (name, extent) in [
                ("api_info", &header.api_info),
                ("dynstr", &header.dynstr),
                ("dynsym", &header.dynsym),
            ] {
                println!(
                    "{}: rodata+0x{:x}, 0x{:x} bytes",
                    name, extent.offset, extent.size
                );
            }
            println!("Total: 0x{:x} bytes", image.total_size());
        }
        None => println!("No NSO loaded"),
    }
}

fn cmd_disasm(analyzer: &Analyzer, args: &[&str]) {
    let Some(arg) = args.first() else {
        println!("Usage: disasm <addr|name> [count]");
        return;
    };
    let Some(addr) = parse_arg(arg) else { return };
    let count = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DISASM_COUNT);

    match analyzer.disassemble_at(addr, count) {
        Ok(insns) => {
            for insn in insns {
                println!("{}", insn);
            }
        }
        Err(e) => println!("{}", e),
    }
}

fn cmd_func(analyzer: &Analyzer, args: &[&str]) {
    let Some(arg) = args.first() else {
        println!("Usage: func <addr|name>");
        return;
    };
    let Some(addr) = parse_arg(arg) else { return };

    match analyzer.function_at(addr) {
        Ok(Some(func)) => {
            println!("Function: {}", func.name);
            println!("Address: 0x{:x}", func.address);
            println!("Size: {} bytes", func.size);
            println!("Leaf: {}", if func.is_leaf { "yes" } else { "no" });
            println!("Thunk: {}", if func.is_thunk { "yes" } else { "no" });
            println!("\nDisassembly:");
            for insn in &func.instructions {
                println!("  {}", insn);
            }
        }
        Ok(None) => println!("No function at 0x{:x}", addr),
        Err(e) => println!("{}", e),
    }
}

fn cmd_pseudo(analyzer: &Analyzer, args: &[&str]) {
    let Some(arg) = args.first() else {
        println!("Usage: pseudo <addr|name>");
        return;
    };
    let Some(addr) = parse_arg(arg) else { return };

    match analyzer.pseudocode_at(addr) {
        Ok(text) => print!("{}", text),
        Err(e) => println!("{}", e),
    }
}

fn cmd_xref(analyzer: &Analyzer, args: &[&str]) {
    let Some(arg) = args.first() else {
        println!("Usage: xref <addr>");
        return;
    };
    let Some(addr) = parse_arg(arg) else { return };

    match (analyzer.refs_to(addr), analyzer.refs_from(addr)) {
        (Ok(to), Ok(from)) => {
            println!("References TO 0x{:x}:", addr);
            for xref in to {
                println!(
                    "  0x{:x} in {} ({})",
                    xref.from_address, xref.from_function_name, xref.description
                );
            }
            println!("\nReferences FROM 0x{:x}:", addr);
            for xref in from {
                println!("  -> 0x{:x} ({})", xref.to_address, xref.description);
            }
        }
        (Err(e), _) | (_, Err(e)) => println!("{}", e),
    }
}

fn cmd_xref_dir(analyzer: &Analyzer, args: &[&str], to: bool) {
    let Some(arg) = args.first() else {
        println!("Usage: {} <addr>", if to { "xrefto" } else { "xreffrom" });
        return;
    };
    let Some(addr) = parse_arg(arg) else { return };

    let result = if to {
        analyzer.refs_to(addr)
    } else {
        analyzer.refs_from(addr)
    };

    match result {
        Ok(refs) => {
            if to {
                println!("References TO 0x{:x}:", addr);
                for xref in refs {
                    println!("  0x{:x} in {}", xref.from_address, xref.from_function_name);
                }
            } else {
                println!("References FROM 0x{:x}:", addr);
                for xref in refs {
                    println!("  -> 0x{:x}", xref.to_address);
                }
            }
        }
        Err(e) => println!("{}", e),
    }
}

fn cmd_strings(analyzer: &Analyzer, args: &[&str]) {
    if args.is_empty() {
        println!("Usage: strings <pattern>");
        return;
    }
    let pattern = args.join(" ");

    match analyzer.search_strings(&pattern, false) {
        Ok(results) => {
            println!("Strings matching '{}':", pattern);
            for s in results {
                println!("  0x{:x}: {}", s.address, s.value);
            }
        }
        Err(e) => println!("{}", e),
    }
}

fn cmd_findstr(analyzer: &Analyzer, args: &[&str]) {
    if args.is_empty() {
        println!("Usage: findstr <string>");
        return;
    }
    let needle = args.join(" ");

    match analyzer.find_string_exact(&needle) {
        Ok(Some(addr)) => println!("Found at 0x{:x}", addr),
        Ok(None) => println!("Not found"),
        Err(e) => println!("{}", e),
    }
}

fn cmd_list(analyzer: &Analyzer, args: &[&str]) {
    let Some(&sub) = args.first() else {
        println!("Usage: list <funcs|funccount|strcount|strings> [limit]");
        return;
    };
    let limit: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);

    match sub.to_lowercase().as_str() {
        "funcs" | "functions" | "func" => {
            let funcs = analyzer.functions();
            for (count, (addr, func)) in funcs.iter().enumerate() {
                if limit > 0 && count >= limit {
                    println!("... (showing {} of {})", limit, funcs.len());
                    return;
                }
                println!("0x{:x}: {} ({} bytes)", addr, func.name, func.size);
            }
            println!("Total: {} functions", funcs.len());
        }
        "funccount" | "fc" => println!("Functions: {}", analyzer.function_count()),
        "strcount" | "sc" => println!("Strings: {}", analyzer.string_count()),
        "strings" | "strs" | "str" => {
            let strings = analyzer.strings();
            for (count, s) in strings.iter().enumerate() {
                if limit > 0 && count >= limit {
                    println!("... (showing {} of {})", limit, strings.len());
                    return;
                }
                let mut display: String = s
                    .value
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
                    .collect();
                if display.len() > 80 {
                    display.truncate(77);
                    display.push_str("...");
                }
                println!("0x{:x} [{}]: {}", s.address, s.length, display);
            }
            println!("Total: {} strings", strings.len());
        }
        other => {
            println!("Unknown list subcommand: {}", other);
            println!("Valid: funcs, funccount, strcount, strings");
        }
    }
}

fn cmd_export(analyzer: &Analyzer, args: &[&str]) {
    let Some(&path) = args.first() else {
        println!("Usage: export <path> [text|csv|json]");
        return;
    };
    let format = match args.get(1) {
        Some(s) => match s.parse::<ExportFormat>() {
            Ok(f) => f,
            Err(e) => {
                println!("{}", e);
                return;
            }
        },
        None => ExportFormat::Text,
    };

    match analyzer.export_dump(path, format) {
        Ok(()) => println!("Exported to: {}", path),
        Err(e) => println!("{}", e),
    }
}

fn cmd_expfunc(analyzer: &Analyzer, args: &[&str]) {
    let Some(&path) = args.first() else {
        println!("Usage: expfunc <path>");
        return;
    };
    match analyzer.export_functions(path) {
        Ok(()) => println!("Exported functions to: {}", path),
        Err(e) => println!("{}", e),
    }
}

fn cmd_expstr(analyzer: &Analyzer, args: &[&str]) {
    let Some(&path) = args.first() else {
        println!("Usage: expstr <path>");
        return;
    };
    match analyzer.export_strings(path) {
        Ok(()) => println!("Exported strings to: {}", path),
        Err(e) => println!("{}", e),
    }
}

fn cmd_save(analyzer: &Analyzer) {
    match analyzer.save_progress() {
        Ok(path) => println!("Progress saved to: {}", path.display()),
        Err(e) => println!("{}", e),
    }
}

fn cmd_progress(analyzer: &mut Analyzer, args: &[&str]) {
    match args.first().copied() {
        Some("list") => {
            let ids = analyzer.list_progress();
            if ids.is_empty() {
                println!("No saved snapshots");
            } else {
                for id in ids {
                    println!("{}", id);
                }
            }
        }
        Some("load") => match args.get(1) {
            Some(id) => match analyzer.load_progress(id) {
                Ok(()) => {
                    println!("Restored snapshot for build ID: {}", id);
                    println!("  Functions: {}", analyzer.function_count());
                    println!("  Strings: {}", analyzer.string_count());
                    println!("  XRefs: {}", analyzer.xref_count());
                }
                Err(e) => println!("{}", e),
            },
            None => println!("Usage: progress load <build-id>"),
        },
        Some("delete") => match args.get(1) {
            Some(id) => match analyzer.delete_progress(id) {
                Ok(()) => println!("Deleted snapshot for build ID: {}", id),
                Err(e) => println!("{}", e),
            },
            None => println!("Usage: progress delete <build-id>"),
        },
        _ => println!("Usage: progress <list|load|delete> [build-id]"),
    }
}
