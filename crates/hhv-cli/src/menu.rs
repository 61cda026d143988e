//! Numbered text menu over the store's aggregate reports.

use std::io::{self, BufRead, Write};

use dialoguer::Input;

use hhv_core::ListingReport;
use hhv_store::ListingReader;

/// Long reports print this many rows, then a remainder line.
pub const PREVIEW_LIMIT: usize = 10;
pub const TOP_LIMIT: u32 = 10;

const RULE: &str = "==================================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    CompanyCounts,
    AllListings,
    AverageSalary,
    AboveAverage,
    KeywordSearch,
    TopBySalary,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(Self::CompanyCounts),
            "2" => Some(Self::AllListings),
            "3" => Some(Self::AverageSalary),
            "4" => Some(Self::AboveAverage),
            "5" => Some(Self::KeywordSearch),
            "6" => Some(Self::TopBySalary),
            "0" => Some(Self::Exit),
            _ => None,
        }
    }
}

fn print_menu(out: &mut impl Write) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "VACANCY REPORTS")?;
    writeln!(out, "1. Companies and their vacancy counts")?;
    writeln!(out, "2. All vacancies")?;
    writeln!(out, "3. Average salary")?;
    writeln!(out, "4. Vacancies paying above average")?;
    writeln!(out, "5. Search vacancies by keyword")?;
    writeln!(out, "6. Top {TOP_LIMIT} vacancies by salary")?;
    writeln!(out, "0. Exit")?;
    writeln!(out, "{RULE}")
}

const CHOICE_PROMPT: &str = "Choose an option (0-6)";
const KEYWORD_PROMPT: &str = "Enter a keyword";

/// Source of the user's answers. `None` means input is exhausted.
pub trait Prompt {
    fn ask(&mut self, out: &mut dyn Write, label: &str) -> io::Result<Option<String>>;
}

/// Interactive terminal prompt.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn ask(&mut self, out: &mut dyn Write, label: &str) -> io::Result<Option<String>> {
        out.flush()?;
        let answer = Input::<String>::new()
            .with_prompt(label)
            .allow_empty(true)
            .interact_text();
        match answer {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(dialoguer::Error::IO(err)) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(dialoguer::Error::IO(err)) => Err(err),
        }
    }
}

/// Line-oriented prompt for piped input.
#[derive(Debug)]
pub struct LinePrompt<R> {
    input: R,
}

impl<R: BufRead> LinePrompt<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> Prompt for LinePrompt<R> {
    fn ask(&mut self, out: &mut dyn Write, label: &str) -> io::Result<Option<String>> {
        write!(out, "{label}: ")?;
        out.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

fn print_listing(out: &mut impl Write, index: usize, listing: &ListingReport) -> io::Result<()> {
    writeln!(out, "{index}. {} - {}", listing.company, listing.title)?;
    writeln!(out, "   Salary: {}", listing.salary)?;
    writeln!(out, "   Link: {}", listing.url.as_deref().unwrap_or("-"))?;
    writeln!(out)
}

fn print_preview(out: &mut impl Write, listings: &[ListingReport]) -> io::Result<()> {
    for (idx, listing) in listings.iter().take(PREVIEW_LIMIT).enumerate() {
        print_listing(out, idx + 1, listing)?;
    }
    if listings.len() > PREVIEW_LIMIT {
        writeln!(out, "... and {} more", listings.len() - PREVIEW_LIMIT)?;
    }
    Ok(())
}

/// `1234567.5` -> `1,234,567.50`
pub fn format_amount(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, digit) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}{grouped}.{cents}")
}

pub async fn print_company_counts<R: ListingReader>(reader: &R, out: &mut impl Write) -> io::Result<bool> {
    let companies = reader.companies_and_listing_counts().await;
    for company in &companies {
        writeln!(out, "{}: {} vacancies", company.company, company.listings)?;
    }
    Ok(!companies.is_empty())
}

async fn handle<R: ListingReader>(
    choice: MenuChoice,
    reader: &R,
    input: &mut impl Prompt,
    out: &mut impl Write,
) -> io::Result<()> {
    match choice {
        MenuChoice::CompanyCounts => {
            writeln!(out, "\n--- Companies and vacancy counts ---")?;
            if !print_company_counts(reader, out).await? {
                writeln!(out, "No company data")?;
            }
        }
        MenuChoice::AllListings => {
            writeln!(out, "\n--- All vacancies ---")?;
            let listings = reader.all_listings().await;
            if listings.is_empty() {
                writeln!(out, "No vacancy data")?;
            } else {
                print_preview(out, &listings)?;
            }
        }
        MenuChoice::AverageSalary => {
            let average = reader.average_salary().await;
            writeln!(out, "\nAverage salary across vacancies: {}", format_amount(average))?;
        }
        MenuChoice::AboveAverage => {
            writeln!(out, "\n--- Vacancies paying above average ---")?;
            let listings = reader.listings_above_average().await;
            if listings.is_empty() {
                writeln!(out, "No vacancies pay above average")?;
            } else {
                print_preview(out, &listings)?;
            }
        }
        MenuChoice::KeywordSearch => {
            let keyword = input.ask(out, KEYWORD_PROMPT)?.unwrap_or_default();
            if keyword.is_empty() {
                writeln!(out, "Keyword must not be empty")?;
                return Ok(());
            }
            writeln!(out, "\n--- Results for '{keyword}' ---")?;
            let listings = reader.listings_with_keyword(&keyword).await;
            if listings.is_empty() {
                writeln!(out, "No vacancies mention '{keyword}'")?;
            }
            for (idx, listing) in listings.iter().enumerate() {
                print_listing(out, idx + 1, listing)?;
            }
        }
        MenuChoice::TopBySalary => {
            writeln!(out, "\n--- Top {TOP_LIMIT} vacancies by salary ---")?;
            let ranked = reader.top_listings_by_salary(TOP_LIMIT).await;
            if ranked.is_empty() {
                writeln!(out, "No vacancy data")?;
            }
            for (idx, entry) in ranked.iter().enumerate() {
                writeln!(out, "{}. {} - {}", idx + 1, entry.listing.company, entry.listing.title)?;
                writeln!(out, "   Salary: {} (midpoint {})", entry.listing.salary, format_amount(entry.midpoint))?;
                writeln!(out, "   Link: {}", entry.listing.url.as_deref().unwrap_or("-"))?;
                writeln!(out)?;
            }
        }
        MenuChoice::Exit => {}
    }
    Ok(())
}

/// Loops until `0` or end of input; anything unrecognised re-prompts.
pub async fn run_menu<R: ListingReader>(
    reader: &R,
    input: &mut impl Prompt,
    out: &mut impl Write,
) -> io::Result<()> {
    loop {
        print_menu(out)?;
        let Some(line) = input.ask(out, CHOICE_PROMPT)? else {
            writeln!(out)?;
            return Ok(());
        };
        match MenuChoice::parse(&line) {
            Some(MenuChoice::Exit) => return Ok(()),
            Some(choice) => handle(choice, reader, input, out).await?,
            None => writeln!(out, "Invalid choice, try again.")?,
        }
    }
}

/// Offers the menu over whatever the store already holds, if anything.
pub async fn run_demo<R: ListingReader>(
    reader: &R,
    input: &mut impl Prompt,
    out: &mut impl Write,
) -> io::Result<()> {
    writeln!(out, "\nNo new vacancies were ingested; reporting on stored data.")?;
    writeln!(out, "\nStored data:")?;
    if print_company_counts(reader, out).await? {
        run_menu(reader, input, out).await
    } else {
        writeln!(out, "The database is empty. Check API access and run `sync` again.")
    }
}
