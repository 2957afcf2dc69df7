use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use phptags::config::Config;
use phptags::index::db::TagStore;
use phptags::index::{FileTag, Tag};
use phptags::query::{ClassOrFile, TagSearch, TagSearchEngine, TraitTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueryMode {
    Exact,
    Near,
    File,
    ClassOrFile,
    Traits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub struct QueryArgs {
    pub mode: QueryMode,
    pub query: String,
    pub project: String,
    pub parents: Vec<String>,
    pub traits: Vec<String>,
    pub source_dirs: Vec<String>,
    pub limit: Option<usize>,
    pub format: OutputFormat,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Row {
    Tag(Tag),
    File(FileTag),
    Trait(TraitTag),
}

fn open_engine(project: &str) -> Result<(Config, TagSearchEngine)> {
    let config = Config::from_project_dir(project);
    let store = TagStore::open(config.db_path(project))
        .with_context(|| format!("failed to open tag store for {}", project))?;
    let engine = TagSearchEngine::from_config(store, &config).context("failed to load native tags")?;
    Ok((config, engine))
}

pub async fn query_index(args: QueryArgs) -> Result<()> {
    let (config, engine) = open_engine(&args.project)?;
    let limit = args.limit.unwrap_or(config.search.default_limit);

    let mut search = TagSearch::parse(&args.query)
        .with_traits(args.traits)
        .with_source_dirs(args.source_dirs);

    // fill the ancestor chain from the index when none was given
    let parents = if args.parents.is_empty() && search.is_member_search() && !search.class_name.is_empty() {
        engine.ancestor_chain(&search.class_name)?
    } else {
        args.parents
    };
    search = search.with_parent_classes(parents);

    let rows: Vec<Row> = match args.mode {
        QueryMode::Exact => engine
            .create_exact_results(&search)?
            .take(limit)
            .map(|t| t.map(Row::Tag))
            .collect::<Result<_, _>>()?,
        QueryMode::Near => engine
            .create_near_match_results(&search)?
            .take(limit)
            .map(|t| t.map(Row::Tag))
            .collect::<Result<_, _>>()?,
        QueryMode::File => engine
            .create_near_match_file_results(&search)?
            .take(limit)
            .map(|f| f.map(Row::File))
            .collect::<Result<_, _>>()?,
        QueryMode::ClassOrFile => engine
            .create_class_or_file_results(&search)?
            .take(limit)
            .map(|m| {
                m.map(|m| match m {
                    ClassOrFile::Tag(tag) => Row::Tag(tag),
                    ClassOrFile::File(file) => Row::File(file),
                })
            })
            .collect::<Result<_, _>>()?,
        QueryMode::Traits => engine
            .create_trait_results(&search)?
            .take(limit)
            .map(|t| t.map(Row::Trait))
            .collect::<Result<_, _>>()?,
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("No results for '{}'", args.query);
            }
            for row in &rows {
                println!("{}", render_row(row));
            }
        }
    }

    Ok(())
}

pub async fn show_parents(class: String, project: String) -> Result<()> {
    let (_, engine) = open_engine(&project)?;
    let chain = engine.ancestor_chain(&class)?;

    if chain.is_empty() {
        println!("{} has no known parent class", class);
    } else {
        println!("{} -> {}", class, chain.join(" -> "));
    }
    Ok(())
}

fn render_row(row: &Row) -> String {
    match row {
        Row::Tag(tag) => render_tag(tag, None),
        Row::Trait(t) => render_tag(&t.to_exposed_tag(), Some(t)),
        Row::File(file) => format!("{:<14} {}", "file", file.full_path),
    }
}

fn render_tag(tag: &Tag, via: Option<&TraitTag>) -> String {
    let location = if tag.is_native {
        "<native>".to_string()
    } else {
        format!("{}:{}", tag.full_path, tag.line_number)
    };
    let mut line = format!("{:<14} {}  {}", tag.kind.as_str(), tag.fully_qualified_name(), location);
    if let Some(via) = via.filter(|t| t.alias.is_some()) {
        line.push_str(&format!("  (alias of {} from {})", via.tag.identifier, via.trait_name));
    }
    if !tag.signature.is_empty() {
        line.push_str("\n    ");
        line.push_str(&tag.signature);
    }
    line
}
