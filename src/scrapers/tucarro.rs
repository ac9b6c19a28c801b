use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::domain::listing::RawListing;
use crate::scrapers::{
    build_reqwest_client, select_first_attr, select_first_text, ScrapeError, ScrapeResult,
    SourceScraper,
};

const SOURCE_ID: &str = "tucarro";

/// Scraper for `tucarro.com.ve` used-car search pages.
pub struct TucarroScraper {
    base_url: Url,
    client: reqwest::Client,
    id_re: Regex,
}

impl TucarroScraper {
    pub fn new() -> ScrapeResult<Self> {
        Ok(Self {
            base_url: Url::parse("https://www.tucarro.com.ve/")
                .map_err(|e| ScrapeError::Build(e.to_string()))?,
            client: build_reqwest_client()?,
            // Listing ids look like MLV123456789 inside the detail URL.
            id_re: Regex::new(r"[/-]([A-Z]{3}-?\d+)").map_err(|e| ScrapeError::Build(e.to_string()))?,
        })
    }

    fn page_url(&self, page: u32) -> String {
        format!("{}carros/usados?page={page}", self.base_url)
    }

    async fn get_text(&self, url: &str) -> ScrapeResult<String> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ScrapeError::Status {
                status: res.status().as_u16(),
                url: url.to_string(),
            });
        }
        res.text().await.map_err(|e| ScrapeError::Http(e.to_string()))
    }

    fn parse_page(&self, document: &Html) -> Vec<RawListing> {
        let card_selector = Selector::parse("li.ui-search-layout__item, div.ui-search-result")
            .expect("static selector");

        document
            .select(&card_selector)
            .filter_map(|card| self.parse_card(card))
            .collect()
    }

    fn parse_card(&self, card: scraper::ElementRef<'_>) -> Option<RawListing> {
        let title = select_first_text(
            card,
            &[
                "h2.ui-search-item__title",
                ".ui-search-item__title",
                "h2 a.ui-search-link",
            ],
        )?;

        let mut listing = RawListing::new(SOURCE_ID);
        listing.raw_text = title.clone();
        listing.fields.insert("title".to_string(), title);

        if let Some(price) = select_first_text(
            card,
            &[
                ".ui-search-price__second-line .andes-money-amount__fraction",
                ".andes-money-amount__fraction",
                ".ui-search-price__part",
            ],
        ) {
            listing.fields.insert("price".to_string(), price);
        }

        if let Some(location) = select_first_text(
            card,
            &[
                ".ui-search-item__location",
                ".ui-search-item__group--location span",
            ],
        ) {
            listing.fields.insert("location".to_string(), location);
        }

        // Attribute rows carry year and mileage on the search card.
        if let Some(attrs) = select_first_text(
            card,
            &[
                "ul.ui-search-card-attributes",
                ".ui-search-item__group--attributes",
            ],
        ) {
            listing.fields.insert("details".to_string(), attrs);
        }

        if let Some(href) = select_first_attr(card, &["a.ui-search-link", "a"], "href") {
            if let Some(captures) = self.id_re.captures(&href) {
                listing.external_id = Some(captures[1].replace('-', ""));
            }
            listing.url = Some(href);
        }

        if let Some(image) = select_first_attr(
            card,
            &["img.ui-search-result-image__element", "img"],
            "data-src",
        )
        .or_else(|| select_first_attr(card, &["img.ui-search-result-image__element", "img"], "src"))
        {
            listing.images.push(image);
        }

        Some(listing)
    }
}

#[async_trait]
impl SourceScraper for TucarroScraper {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_page(&self, page: u32) -> ScrapeResult<Vec<RawListing>> {
        let url = self.page_url(page);
        let body = self.get_text(&url).await?;
        let document = Html::parse_document(&body);
        Ok(self.parse_page(&document))
    }
}
